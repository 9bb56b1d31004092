//! Click packages - JSON manifests with desktop hooks

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use super::desktop::DesktopEntry;
use super::icons::IconCache;
use super::AppInfo;
use crate::core::appid::{AppId, PackageLookup};

/// Access to the click package database
pub trait ClickDatabase: Send {
    /// Names of installed packages
    fn packages(&self) -> Result<Vec<String>>;

    /// The package manifest
    fn manifest(&self, package: &str) -> Result<Value>;

    /// Directory of the current version of the package
    fn package_dir(&self, package: &str) -> Result<PathBuf>;
}

/// Reads manifests from `<root>/<package>/current/.click/info/<package>.manifest`
#[derive(Debug, Clone)]
pub struct FsClickDatabase {
    root: PathBuf,
}

impl FsClickDatabase {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn manifest_path(&self, package: &str) -> PathBuf {
        self.root
            .join(package)
            .join("current")
            .join(".click")
            .join("info")
            .join(format!("{}.manifest", package))
    }
}

impl ClickDatabase for FsClickDatabase {
    fn packages(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };

        let mut packages: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| self.manifest_path(name).is_file())
            .collect();
        packages.sort();
        Ok(packages)
    }

    fn manifest(&self, package: &str) -> Result<Value> {
        let path = self.manifest_path(package);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))
    }

    fn package_dir(&self, package: &str) -> Result<PathBuf> {
        let dir = self.root.join(package).join("current");
        if !dir.is_dir() {
            anyhow::bail!("Package directory {} does not exist", dir.display());
        }
        Ok(dir)
    }
}

/// Application names with a desktop hook, in manifest order
pub fn manifest_apps(manifest: &Value) -> Vec<String> {
    manifest
        .get("hooks")
        .and_then(Value::as_object)
        .map(|hooks| {
            hooks
                .iter()
                .filter(|(_, hook)| hook.get("desktop").is_some())
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
}

pub fn manifest_version(manifest: &Value) -> Option<String> {
    manifest
        .get("version")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn manifest_desktop(manifest: &Value, appname: &str) -> Option<String> {
    manifest
        .get("hooks")?
        .get(appname)?
        .get("desktop")?
        .as_str()
        .map(String::from)
}

pub struct ClickBackend {
    db: Box<dyn ClickDatabase>,
}

impl ClickBackend {
    pub fn new(db: Box<dyn ClickDatabase>) -> Self {
        Self { db }
    }

    /// The manifest, if it has the fields every click package needs
    fn manifest(&self, package: &str) -> Option<Value> {
        match self.db.manifest(package) {
            Ok(manifest) if manifest_version(&manifest).is_some() => Some(manifest),
            Ok(_) => {
                warn!("Click manifest for '{}' has no version", package);
                None
            }
            Err(e) => {
                debug!("No click manifest for '{}': {}", package, e);
                None
            }
        }
    }

    pub fn info(&self, id: &AppId, icons: &mut IconCache) -> Result<AppInfo> {
        let manifest = self
            .manifest(id.package())
            .with_context(|| format!("No click package for {}", id))?;
        let desktop = manifest_desktop(&manifest, id.appname())
            .with_context(|| format!("No desktop hook for {}", id))?;
        let dir = self.db.package_dir(id.package())?;
        let desktop_path = dir.join(&desktop);
        let entry = DesktopEntry::from_file(&desktop_path)?;

        Ok(AppInfo {
            name: entry.name,
            icon_path: entry.icon.as_deref().and_then(|icon| package_icon(&dir, icon, icons)),
            working_directory: entry.path.or_else(|| Some(dir.clone())),
            exec: entry.exec,
            desktop_path,
            app_dir: Some(dir),
            single_instance: entry.single_instance.unwrap_or(true),
        })
    }

    pub fn list(&self) -> Vec<AppId> {
        let packages = match self.db.packages() {
            Ok(packages) => packages,
            Err(e) => {
                warn!("Unable to list click packages: {}", e);
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        for package in packages {
            let Some(manifest) = self.manifest(&package) else {
                continue;
            };
            let Some(version) = manifest_version(&manifest) else {
                continue;
            };
            for app in manifest_apps(&manifest) {
                let id = AppId::new(package.as_str(), app, version.as_str());
                if !id.is_empty() {
                    ids.push(id);
                }
            }
        }
        ids
    }
}

/// Icons in click packages are relative to the package directory
fn package_icon(dir: &Path, icon: &str, icons: &mut IconCache) -> Option<PathBuf> {
    let relative = dir.join(icon);
    if relative.is_file() {
        return Some(relative);
    }
    icons.finder(dir).find(icon)
}

impl PackageLookup for ClickBackend {
    fn verify_package(&self, package: &str) -> bool {
        self.manifest(package).is_some()
    }

    fn app_names(&self, package: &str) -> Vec<String> {
        self.manifest(package)
            .map(|m| manifest_apps(&m))
            .unwrap_or_default()
    }

    fn find_version(&self, package: &str, appname: &str) -> Option<String> {
        let manifest = self.manifest(package)?;
        if !manifest_apps(&manifest).iter().any(|a| a == appname) {
            return None;
        }
        manifest_version(&manifest)
    }

    fn has_app_id(&self, id: &AppId) -> bool {
        self.find_version(id.package(), id.appname()).as_deref() == Some(id.version())
    }
}
