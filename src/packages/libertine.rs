//! Libertine containers - legacy desktop apps installed inside a container
//!
//! The container name is the package. Desktop files are looked up in the
//! system-provisioned container root first, then in the user's container
//! data.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use super::desktop::DesktopEntry;
use super::icons::IconCache;
use super::AppInfo;
use crate::core::appid::{AppId, ApplicationWildcard, PackageLookup};

pub const LIBERTINE_VERSION: &str = "0.0";

/// Access to the container service
pub trait LibertineService: Send {
    fn containers(&self) -> Result<Vec<String>>;

    /// Applications installed in `container`
    fn apps(&self, container: &str) -> Result<Vec<String>>;
}

/// Candidate `share` directories for a container, system first
fn share_dirs(cache_dir: &Path, data_dir: &Path, container: &str) -> [PathBuf; 2] {
    [
        cache_dir
            .join("libertine-container")
            .join(container)
            .join("rootfs/usr/share"),
        data_dir
            .join("libertine-container/user-data")
            .join(container)
            .join(".local/share"),
    ]
}

/// Lists containers and their desktop files straight from disk
#[derive(Debug, Clone)]
pub struct FsLibertineService {
    cache_dir: PathBuf,
    data_dir: PathBuf,
}

impl FsLibertineService {
    pub fn new(cache_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            data_dir: data_dir.into(),
        }
    }
}

impl LibertineService for FsLibertineService {
    fn containers(&self) -> Result<Vec<String>> {
        let root = self.cache_dir.join("libertine-container");
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", root.display())),
        };
        let mut containers: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join("rootfs").is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        containers.sort();
        Ok(containers)
    }

    fn apps(&self, container: &str) -> Result<Vec<String>> {
        let mut apps = Vec::new();
        for share in share_dirs(&self.cache_dir, &self.data_dir, container) {
            let Ok(entries) = std::fs::read_dir(share.join("applications")) else {
                continue;
            };
            for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
                if path.extension().is_some_and(|ext| ext == "desktop") {
                    if let Some(stem) = path.file_stem() {
                        let name = stem.to_string_lossy().to_string();
                        if !apps.contains(&name) {
                            apps.push(name);
                        }
                    }
                }
            }
        }
        apps.sort();
        Ok(apps)
    }
}

pub struct LibertineBackend {
    service: Box<dyn LibertineService>,
    cache_dir: PathBuf,
    data_dir: PathBuf,
}

impl LibertineBackend {
    pub fn new(
        service: Box<dyn LibertineService>,
        cache_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            cache_dir: cache_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// The first `share` directory holding the app's desktop file
    fn locate(&self, container: &str, app: &str) -> Option<(PathBuf, PathBuf)> {
        share_dirs(&self.cache_dir, &self.data_dir, container)
            .into_iter()
            .find_map(|share| {
                let file = share.join("applications").join(format!("{}.desktop", app));
                file.is_file().then_some((share, file))
            })
    }

    pub fn info(&self, id: &AppId, icons: &mut IconCache) -> Result<AppInfo> {
        let (share, desktop_path) = self
            .locate(id.package(), id.appname())
            .with_context(|| format!("No desktop file for {} in any container path", id))?;
        let entry = DesktopEntry::from_file(&desktop_path)?;

        Ok(AppInfo {
            name: entry.name,
            icon_path: entry.icon.as_deref().and_then(|icon| icons.finder(&share).find(icon)),
            working_directory: entry.path,
            exec: format!("libertine-launch --id={} {}", id.package(), entry.exec),
            desktop_path,
            app_dir: None,
            single_instance: false,
        })
    }

    pub fn list(&self) -> Vec<AppId> {
        let containers = match self.service.containers() {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Unable to list libertine containers: {}", e);
                return Vec::new();
            }
        };
        containers
            .iter()
            .flat_map(|c| {
                self.app_names(c)
                    .into_iter()
                    .map(move |app| AppId::new(c.as_str(), app, LIBERTINE_VERSION))
            })
            .filter(|id| !id.is_empty())
            .collect()
    }
}

impl PackageLookup for LibertineBackend {
    fn verify_package(&self, package: &str) -> bool {
        match self.service.containers() {
            Ok(containers) => containers.iter().any(|c| c == package),
            Err(e) => {
                warn!("Unable to list libertine containers: {}", e);
                false
            }
        }
    }

    fn app_names(&self, package: &str) -> Vec<String> {
        self.service.apps(package).unwrap_or_else(|e| {
            warn!("Unable to list apps in container '{}': {}", package, e);
            Vec::new()
        })
    }

    fn verify_appname(&self, package: &str, appname: &str) -> bool {
        self.locate(package, appname).is_some()
    }

    /// Containers have no declared order, so wildcards never resolve
    fn find_appname(&self, _package: &str, _wildcard: ApplicationWildcard) -> Option<String> {
        None
    }

    fn find_version(&self, package: &str, appname: &str) -> Option<String> {
        self.verify_appname(package, appname)
            .then(|| LIBERTINE_VERSION.to_string())
    }

    fn has_app_id(&self, id: &AppId) -> bool {
        id.version() == LIBERTINE_VERSION && self.verify_appname(id.package(), id.appname())
    }
}
