//! Themed icon lookup under a data directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

const EXTENSIONS: [&str; 3] = ["png", "svg", "xpm"];

/// Finds icons in the `hicolor` theme and `pixmaps` of one base directory.
///
/// The size directories are scanned once, when the finder is created.
#[derive(Debug, Clone)]
pub struct IconFinder {
    base: PathBuf,
    /// `hicolor` directories, best first
    theme_dirs: Vec<PathBuf>,
}

impl IconFinder {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let theme_dirs = scan_theme_dirs(&base.join("icons").join("hicolor"));
        debug!(
            "Icon finder for {} has {} theme directories",
            base.display(),
            theme_dirs.len()
        );
        Self { base, theme_dirs }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve an `Icon=` value to a file
    pub fn find(&self, icon: &str) -> Option<PathBuf> {
        let as_path = Path::new(icon);
        if as_path.is_absolute() {
            return as_path.is_file().then(|| as_path.to_path_buf());
        }

        for dir in &self.theme_dirs {
            if let Some(found) = with_extensions(&dir.join("apps"), icon) {
                return Some(found);
            }
        }

        let pixmaps = self.base.join("pixmaps");
        if let Some(found) = with_extensions(&pixmaps, icon) {
            return Some(found);
        }
        let bare = pixmaps.join(icon);
        bare.is_file().then_some(bare)
    }
}

fn with_extensions(dir: &Path, name: &str) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", name, ext)))
        .find(|p| p.is_file())
}

/// `scalable` first, then numeric sizes largest first
fn scan_theme_dirs(hicolor: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(hicolor) else {
        return Vec::new();
    };

    let mut sized: Vec<(u32, PathBuf)> = Vec::new();
    let mut scalable = None;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "scalable" {
            scalable = Some(entry.path());
        } else if let Some(size) = name
            .split_once('x')
            .and_then(|(w, _)| w.parse::<u32>().ok())
        {
            sized.push((size, entry.path()));
        }
    }
    sized.sort_by(|a, b| b.0.cmp(&a.0));

    scalable
        .into_iter()
        .chain(sized.into_iter().map(|(_, p)| p))
        .collect()
}

/// Finders keyed by base directory, created on first use
#[derive(Debug, Default)]
pub struct IconCache {
    finders: HashMap<PathBuf, IconFinder>,
}

impl IconCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finder(&mut self, base: &Path) -> &IconFinder {
        self.finders
            .entry(base.to_path_buf())
            .or_insert_with(|| IconFinder::new(base))
    }

    pub fn len(&self) -> usize {
        self.finders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finders.is_empty()
    }
}
