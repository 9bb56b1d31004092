//! Snap packages - apps that plug a graphical interface

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::desktop::DesktopEntry;
use super::AppInfo;
use crate::core::appid::{AppId, PackageLookup};

/// Interfaces that mark an app as something a user launches
pub const GRAPHICAL_INTERFACES: [&str; 4] = ["unity7", "unity8", "x11", "mir"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapApp {
    pub name: String,
    #[serde(default)]
    pub plugs: Vec<String>,
}

impl SnapApp {
    pub fn is_graphical(&self) -> bool {
        self.plugs
            .iter()
            .any(|p| GRAPHICAL_INTERFACES.contains(&p.as_str()))
    }
}

/// What snapd reports about one installed snap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    pub name: String,
    pub version: String,
    /// Mount point of the current revision
    pub directory: PathBuf,
    #[serde(default)]
    pub apps: Vec<SnapApp>,
}

impl SnapInfo {
    /// Graphical apps in snapd's order
    pub fn graphical_apps(&self) -> Vec<String> {
        self.apps
            .iter()
            .filter(|a| a.is_graphical())
            .map(|a| a.name.clone())
            .collect()
    }
}

/// Access to snapd
pub trait SnapdClient: Send {
    /// Names of installed snaps
    fn installed(&self) -> Result<Vec<String>>;

    /// `None` when the snap is not installed
    fn package_info(&self, package: &str) -> Result<Option<SnapInfo>>;
}

pub struct SnapBackend {
    client: Box<dyn SnapdClient>,
    snap_root: PathBuf,
    desktop_dir: PathBuf,
    basedir: Option<PathBuf>,
}

impl SnapBackend {
    pub fn new(
        client: Box<dyn SnapdClient>,
        snap_root: impl Into<PathBuf>,
        desktop_dir: impl Into<PathBuf>,
        basedir: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            snap_root: snap_root.into(),
            desktop_dir: desktop_dir.into(),
            basedir,
        }
    }

    /// Package info, only for snaps with at least one graphical app
    fn package(&self, package: &str) -> Option<SnapInfo> {
        match self.client.package_info(package) {
            Ok(Some(info)) if !info.graphical_apps().is_empty() => Some(info),
            Ok(_) => None,
            Err(e) => {
                warn!("Unable to get snap info for '{}': {}", package, e);
                None
            }
        }
    }

    pub fn info(&self, id: &AppId) -> Result<AppInfo> {
        let snap = self
            .package(id.package())
            .with_context(|| format!("No snap package for {}", id))?;
        if !snap.graphical_apps().iter().any(|a| a == id.appname()) {
            anyhow::bail!("Snap {} has no graphical app {}", id.package(), id.appname());
        }
        let desktop_path = self
            .desktop_dir
            .join(format!("{}_{}.desktop", id.package(), id.appname()));
        let entry = DesktopEntry::from_file(&desktop_path)?;

        Ok(AppInfo {
            name: entry.name,
            icon_path: entry
                .icon
                .as_deref()
                .and_then(|icon| self.find_icon(id.package(), &snap.directory, icon)),
            working_directory: entry.path.or_else(|| Some(snap.directory.clone())),
            exec: entry.exec,
            desktop_path,
            app_dir: Some(snap.directory),
            single_instance: entry.single_instance.unwrap_or(true),
        })
    }

    /// Icon lookup, first existing candidate wins:
    /// an absolute path inside the current revision, the path under the
    /// package-root override, the unprefixed name in `meta/gui`, and the
    /// unprefixed name at the package directory.
    pub fn find_icon(&self, package: &str, package_dir: &Path, icon: &str) -> Option<PathBuf> {
        let unprefixed = icon
            .strip_prefix("${SNAP}/")
            .unwrap_or(icon)
            .trim_start_matches('/');

        let mut candidates = Vec::new();
        if icon.starts_with('/') {
            candidates.push(
                self.snap_root
                    .join(package)
                    .join("current")
                    .join(icon.trim_start_matches('/')),
            );
        }
        if let Some(base) = &self.basedir {
            candidates.push(base.join(icon.trim_start_matches('/')));
        }
        candidates.push(package_dir.join("meta").join("gui").join(unprefixed));
        candidates.push(package_dir.join(unprefixed));

        candidates.into_iter().find(|p| p.is_file())
    }

    pub fn list(&self) -> Vec<AppId> {
        let installed = match self.client.installed() {
            Ok(installed) => installed,
            Err(e) => {
                warn!("Unable to list snaps: {}", e);
                return Vec::new();
            }
        };
        installed
            .iter()
            .filter_map(|name| self.package(name))
            .flat_map(|snap| {
                snap.graphical_apps()
                    .into_iter()
                    .map(|app| AppId::new(snap.name.as_str(), app, snap.version.as_str()))
                    .collect::<Vec<_>>()
            })
            .filter(|id| !id.is_empty())
            .collect()
    }
}

impl PackageLookup for SnapBackend {
    fn verify_package(&self, package: &str) -> bool {
        self.package(package).is_some()
    }

    fn app_names(&self, package: &str) -> Vec<String> {
        self.package(package)
            .map(|s| s.graphical_apps())
            .unwrap_or_default()
    }

    fn find_version(&self, package: &str, appname: &str) -> Option<String> {
        let snap = self.package(package)?;
        snap.graphical_apps()
            .iter()
            .any(|a| a == appname)
            .then_some(snap.version)
    }

    fn has_app_id(&self, id: &AppId) -> bool {
        self.find_version(id.package(), id.appname()).as_deref() == Some(id.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::appid::{discover_in, ApplicationWildcard};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    struct FakeSnapd(HashMap<String, SnapInfo>);

    impl SnapdClient for FakeSnapd {
        fn installed(&self) -> Result<Vec<String>> {
            let mut names: Vec<String> = self.0.keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        fn package_info(&self, package: &str) -> Result<Option<SnapInfo>> {
            Ok(self.0.get(package).cloned())
        }
    }

    fn snap(name: &str, dir: &Path, apps: &[(&str, &[&str])]) -> SnapInfo {
        SnapInfo {
            name: name.to_string(),
            version: "x123".to_string(),
            directory: dir.to_path_buf(),
            apps: apps
                .iter()
                .map(|(n, plugs)| SnapApp {
                    name: n.to_string(),
                    plugs: plugs.iter().map(|p| p.to_string()).collect(),
                })
                .collect(),
        }
    }

    fn backend(tmp: &Path, basedir: Option<PathBuf>) -> SnapBackend {
        let mut snaps = HashMap::new();
        snaps.insert(
            "unity8-package".to_string(),
            snap(
                "unity8-package",
                &tmp.join("snap/unity8-package/x123"),
                &[("foo", &["unity8", "network"][..]), ("daemon", &["network"][..])],
            ),
        );
        snaps.insert(
            "headless".to_string(),
            snap("headless", &tmp.join("snap/headless/x1"), &[("svc", &["network"][..])]),
        );
        SnapBackend::new(
            Box::new(FakeSnapd(snaps)),
            tmp.join("snap"),
            tmp.join("desktop"),
            basedir,
        )
    }

    #[test]
    fn only_graphical_apps_count() {
        let tmp = TempDir::new().expect("tempdir");
        let backends = [backend(tmp.path(), None)];
        let id = discover_in(&backends, "unity8-package", None, None, ApplicationWildcard::OnlyListed);
        assert_eq!(id.to_string(), "unity8-package_foo_x123");
        assert!(!backends[0].verify_package("headless"));
        assert!(!backends[0].verify_appname("unity8-package", "daemon"));
        assert_eq!(backends[0].list(), vec![id]);
    }

    #[test]
    fn icon_lookup_order() {
        let tmp = TempDir::new().expect("tempdir");
        let base = tmp.path().join("basedir");
        let backend = backend(tmp.path(), Some(base.clone()));
        let pkg_dir = tmp.path().join("snap/unity8-package/x123");

        let root_icon = pkg_dir.join("icon.png");
        fs::create_dir_all(&pkg_dir).expect("mkdir");
        fs::write(&root_icon, b"").expect("write");
        assert_eq!(backend.find_icon("unity8-package", &pkg_dir, "${SNAP}/icon.png"), Some(root_icon));

        let gui_icon = pkg_dir.join("meta/gui/icon.png");
        fs::create_dir_all(gui_icon.parent().expect("parent")).expect("mkdir");
        fs::write(&gui_icon, b"").expect("write");
        assert_eq!(backend.find_icon("unity8-package", &pkg_dir, "${SNAP}/icon.png"), Some(gui_icon));

        let current_icon = tmp.path().join("snap/unity8-package/current/share/icon.png");
        fs::create_dir_all(current_icon.parent().expect("parent")).expect("mkdir");
        fs::write(&current_icon, b"").expect("write");
        let based_icon = base.join("share/icon.png");
        fs::create_dir_all(based_icon.parent().expect("parent")).expect("mkdir");
        fs::write(&based_icon, b"").expect("write");
        assert_eq!(
            backend.find_icon("unity8-package", &pkg_dir, "/share/icon.png"),
            Some(current_icon.clone())
        );
        fs::remove_file(&current_icon).expect("remove");
        assert_eq!(backend.find_icon("unity8-package", &pkg_dir, "/share/icon.png"), Some(based_icon));
    }
}
