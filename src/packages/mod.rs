//! Package backends - sources of installed-application truth
//!
//! The registry queries backends in a fixed order (click, legacy, libertine,
//! snap) and the first that knows a package answers for it.

pub mod click;
pub mod desktop;
pub mod icons;
pub mod legacy;
pub mod libertine;
pub mod snap;

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::appid::{AppId, ApplicationWildcard, PackageLookup};
use crate::core::environment::{self, LaunchEnv};

pub use click::{ClickBackend, ClickDatabase, FsClickDatabase};
pub use desktop::DesktopEntry;
pub use icons::{IconCache, IconFinder};
pub use legacy::LegacyBackend;
pub use libertine::{FsLibertineService, LibertineBackend, LibertineService};
pub use snap::{SnapApp, SnapBackend, SnapInfo, SnapdClient};

/// Which packaging system an application comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Click,
    Legacy,
    Libertine,
    Snap,
}

impl BackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Legacy => "legacy",
            Self::Libertine => "libertine",
            Self::Snap => "snap",
        }
    }

    /// Supervisor job applications of this kind run under
    pub fn job_name(&self) -> &'static str {
        match self {
            Self::Click => "application-click",
            Self::Legacy | Self::Libertine => "application-legacy",
            Self::Snap => "application-snap",
        }
    }

    /// Every application job name, without duplicates
    pub fn app_jobs() -> &'static [&'static str] {
        &["application-click", "application-legacy", "application-snap"]
    }
}

/// Metadata needed to display and launch an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Display name
    pub name: String,
    pub icon_path: Option<PathBuf>,
    /// Default working directory
    pub working_directory: Option<PathBuf>,
    /// Desktop-file style command line
    pub exec: String,
    pub desktop_path: PathBuf,
    /// Package directory exported as `APP_DIR`
    pub app_dir: Option<PathBuf>,
    pub single_instance: bool,
}

/// One package backend
pub enum PackageBackend {
    Click(ClickBackend),
    Legacy(LegacyBackend),
    Libertine(LibertineBackend),
    Snap(SnapBackend),
}

impl PackageBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Click(_) => BackendKind::Click,
            Self::Legacy(_) => BackendKind::Legacy,
            Self::Libertine(_) => BackendKind::Libertine,
            Self::Snap(_) => BackendKind::Snap,
        }
    }

    /// Metadata for an application this backend knows
    pub fn info(&self, id: &AppId, icons: &mut IconCache) -> Result<AppInfo> {
        match self {
            Self::Click(b) => b.info(id, icons),
            Self::Legacy(b) => b.info(id, icons),
            Self::Libertine(b) => b.info(id, icons),
            Self::Snap(b) => b.info(id),
        }
    }

    /// Every installed application
    pub fn list(&self) -> Vec<AppId> {
        match self {
            Self::Click(b) => b.list(),
            Self::Legacy(b) => b.list(),
            Self::Libertine(b) => b.list(),
            Self::Snap(b) => b.list(),
        }
    }

    /// Backend-specific additions to a launch environment.
    ///
    /// Click packages also get their bundled binaries and libraries put in
    /// front of the search paths that `inherited` reports.
    pub fn launch_env(
        &self,
        info: &AppInfo,
        arch: Option<&str>,
        inherited: impl Fn(&str) -> Option<String>,
        env: &mut LaunchEnv,
    ) {
        let app_dir = info.app_dir.as_ref().map(|dir| dir.display().to_string());
        if let Some(dir) = &app_dir {
            env.set(environment::APP_DIR, dir.as_str());
        }
        match self {
            Self::Click(_) | Self::Snap(_) => {
                if let Some(arch) = arch {
                    env.set(environment::ARCH, arch);
                }
            }
            Self::Legacy(_) | Self::Libertine(_) => {}
        }
        if let (Self::Click(_), Some(dir)) = (self, &app_dir) {
            environment::compose_search_paths(
                Some(dir.as_str()),
                arch,
                inherited(environment::PATH).as_deref(),
                inherited(environment::LD_LIBRARY_PATH).as_deref(),
                inherited(environment::QML2_IMPORT_PATH).as_deref(),
            )
            .apply(env);
        }
    }

    /// Directories whose desktop files describe this backend's apps
    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        match self {
            Self::Legacy(b) => b.application_dirs(),
            _ => Vec::new(),
        }
    }

    fn lookup(&self) -> &dyn PackageLookup {
        match self {
            Self::Click(b) => b as &dyn PackageLookup,
            Self::Legacy(b) => b as &dyn PackageLookup,
            Self::Libertine(b) => b as &dyn PackageLookup,
            Self::Snap(b) => b as &dyn PackageLookup,
        }
    }
}

impl PackageLookup for PackageBackend {
    fn verify_package(&self, package: &str) -> bool {
        self.lookup().verify_package(package)
    }

    fn app_names(&self, package: &str) -> Vec<String> {
        self.lookup().app_names(package)
    }

    fn verify_appname(&self, package: &str, appname: &str) -> bool {
        self.lookup().verify_appname(package, appname)
    }

    fn find_appname(&self, package: &str, wildcard: ApplicationWildcard) -> Option<String> {
        self.lookup().find_appname(package, wildcard)
    }

    fn find_version(&self, package: &str, appname: &str) -> Option<String> {
        self.lookup().find_version(package, appname)
    }

    fn has_app_id(&self, id: &AppId) -> bool {
        self.lookup().has_app_id(id)
    }
}

impl std::fmt::Debug for PackageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PackageBackend({})", self.kind().label())
    }
}
