//! Legacy applications - plain desktop files in XDG data directories
//!
//! The package and application name are the same string, and the version is
//! always `0.0`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::desktop::DesktopEntry;
use super::icons::IconCache;
use super::AppInfo;
use crate::core::appid::{AppId, PackageLookup};

pub const LEGACY_VERSION: &str = "0.0";

#[derive(Debug, Clone)]
pub struct LegacyBackend {
    /// Data directories, user directory first
    data_dirs: Vec<PathBuf>,
}

impl LegacyBackend {
    pub fn new(data_dirs: Vec<PathBuf>) -> Self {
        Self { data_dirs }
    }

    /// `<dir>/applications` for every data directory, in search order
    pub fn application_dirs(&self) -> Vec<PathBuf> {
        self.data_dirs.iter().map(|d| d.join("applications")).collect()
    }

    /// Id for a desktop file name without its extension. Empty when the
    /// name cannot be an id segment.
    pub fn app_id(name: &str) -> AppId {
        AppId::parse(&format!("{0}_{0}_{1}", name, LEGACY_VERSION))
    }

    /// The data directory and desktop file for `name`, first match wins
    fn locate(&self, name: &str) -> Option<(PathBuf, PathBuf)> {
        if name.is_empty() || name.contains('/') {
            return None;
        }
        self.data_dirs.iter().find_map(|dir| {
            let file = dir.join("applications").join(format!("{}.desktop", name));
            file.is_file().then(|| (dir.clone(), file))
        })
    }

    pub fn info(&self, id: &AppId, icons: &mut IconCache) -> Result<AppInfo> {
        if !self.has_app_id(id) {
            anyhow::bail!("{} is not a legacy application", id);
        }
        let (data_dir, desktop_path) = self
            .locate(id.appname())
            .with_context(|| format!("No desktop file for {}", id.appname()))?;
        let entry = DesktopEntry::from_file(&desktop_path)?;

        Ok(AppInfo {
            name: entry.name,
            icon_path: entry
                .icon
                .as_deref()
                .and_then(|icon| icons.finder(&data_dir).find(icon)),
            working_directory: entry.path,
            exec: entry.exec,
            desktop_path,
            app_dir: None,
            single_instance: entry.single_instance.unwrap_or(false),
        })
    }

    /// Displayable desktop files; a user file hides a system one of the same name
    pub fn list(&self) -> Vec<AppId> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for dir in self.application_dirs() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut names: Vec<(String, PathBuf)> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "desktop"))
                .filter_map(|p| {
                    let stem = p.file_stem()?.to_string_lossy().to_string();
                    Some((stem, p))
                })
                .collect();
            names.sort();

            for (name, path) in names {
                if !seen.insert(name.clone()) {
                    continue;
                }
                if !displayable(&path) {
                    continue;
                }
                let id = Self::app_id(&name);
                if !id.is_empty() {
                    ids.push(id);
                }
            }
        }
        ids
    }
}

fn displayable(path: &Path) -> bool {
    match DesktopEntry::from_file(path) {
        Ok(entry) => !entry.no_display,
        Err(e) => {
            debug!("Skipping {}: {}", path.display(), e);
            false
        }
    }
}

impl PackageLookup for LegacyBackend {
    fn verify_package(&self, package: &str) -> bool {
        self.locate(package).is_some()
    }

    fn app_names(&self, package: &str) -> Vec<String> {
        if self.verify_package(package) {
            vec![package.to_string()]
        } else {
            Vec::new()
        }
    }

    fn verify_appname(&self, package: &str, appname: &str) -> bool {
        package == appname && self.verify_package(package)
    }

    fn find_version(&self, package: &str, appname: &str) -> Option<String> {
        self.verify_appname(package, appname)
            .then(|| LEGACY_VERSION.to_string())
    }

    fn has_app_id(&self, id: &AppId) -> bool {
        id.version() == LEGACY_VERSION && self.verify_appname(id.package(), id.appname())
    }
}
