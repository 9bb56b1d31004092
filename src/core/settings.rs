//! Launch configuration: filesystem roots, timeouts and tool paths

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment override for the `/proc` root used for OOM adjustments
pub const ENV_OOM_PROC_PATH: &str = "UBUNTU_APP_LAUNCH_OOM_PROC_PATH";
/// Environment override for the snap package root used in icon lookup
pub const ENV_SNAP_BASEDIR: &str = "UBUNTU_APP_LAUNCH_SNAP_BASEDIR";
/// Environment override for the demangler used by session helpers
pub const ENV_DEMANGLER: &str = "UBUNTU_APP_LAUNCH_DEMANGLER";
/// Architecture triplet passed to launched applications
pub const ENV_ARCH: &str = "UBUNTU_APP_LAUNCH_ARCH";
/// Root of the cgroup filesystem
pub const ENV_CGROUP_ROOT: &str = "UBUNTU_APP_LAUNCH_SYSTEMD_CGROUP_ROOT";

/// Which supervisor flavor to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SupervisorFlavor {
    Upstart,
    #[default]
    Systemd,
}

impl SupervisorFlavor {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Upstart => "upstart",
            Self::Systemd => "systemd",
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Supervisor the job backend speaks to
    pub supervisor: SupervisorFlavor,

    // Package locations
    /// User data directory, scanned before the system ones
    pub user_data_dir: PathBuf,
    /// System data directories in precedence order
    pub system_data_dirs: Vec<PathBuf>,
    /// User cache directory, holds system-provisioned containers
    pub user_cache_dir: PathBuf,
    /// Root of the click package database
    pub click_root: PathBuf,
    /// Where snapd mounts packages
    pub snap_root: PathBuf,
    /// Where snapd installs desktop files
    pub snap_desktop_dir: PathBuf,
    /// Package-root override consulted during snap icon lookup
    pub snap_basedir: Option<PathBuf>,

    // Process control
    /// Root of the proc filesystem
    pub proc_root: PathBuf,
    /// Root of the cgroup filesystem
    pub cgroup_root: PathBuf,
    /// Timeout for establishing the cgroup manager connection, in ms
    pub cgroup_connect_timeout_ms: u64,
    /// Idle time before the cgroup manager connection is dropped, in seconds
    pub cgroup_idle_secs: u64,

    // Launching
    /// Exec tool run by transient units
    pub exec_tool: PathBuf,
    /// Demangler prepended to session helper exec lines
    pub demangler: PathBuf,
    /// Architecture triplet for library search paths
    pub arch: Option<String>,
    /// Watch desktop directories for added, removed and updated apps
    pub watch_desktop_dirs: bool,
    /// How often watched directories are rescanned, in ms
    pub watch_interval_ms: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        let user_data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".local/share"));
        let user_cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));

        Self {
            supervisor: SupervisorFlavor::Systemd,

            user_data_dir,
            system_data_dirs: vec![
                PathBuf::from("/usr/local/share"),
                PathBuf::from("/usr/share"),
            ],
            user_cache_dir,
            click_root: PathBuf::from("/opt/click.ubuntu.com"),
            snap_root: PathBuf::from("/snap"),
            snap_desktop_dir: PathBuf::from("/var/lib/snapd/desktop/applications"),
            snap_basedir: None,

            proc_root: PathBuf::from("/proc"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_connect_timeout_ms: 1000,
            cgroup_idle_secs: 300,

            exec_tool: PathBuf::from("/usr/lib/ubuntu-app-launch/exec-line-exec"),
            demangler: PathBuf::from("/usr/lib/ubuntu-app-launch/socket-demangler"),
            arch: None,
            watch_desktop_dirs: false,
            watch_interval_ms: 2000,
        }
    }
}

impl LaunchConfig {
    /// Defaults with the process environment applied on top
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from `lookup`. Empty values count as unset.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(dir) = get(ENV_OOM_PROC_PATH) {
            self.proc_root = PathBuf::from(dir);
        }
        if let Some(dir) = get(ENV_SNAP_BASEDIR) {
            self.snap_basedir = Some(PathBuf::from(dir));
        }
        if let Some(path) = get(ENV_DEMANGLER) {
            self.demangler = PathBuf::from(path);
        }
        if let Some(arch) = get(ENV_ARCH) {
            self.arch = Some(arch);
        }
        if let Some(root) = get(ENV_CGROUP_ROOT) {
            self.cgroup_root = PathBuf::from(root);
        }
        if let Some(dir) = get("XDG_DATA_HOME") {
            self.user_data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("XDG_CACHE_HOME") {
            self.user_cache_dir = PathBuf::from(dir);
        }
        if let Some(dirs) = get("XDG_DATA_DIRS") {
            self.system_data_dirs = dirs
                .split(':')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect();
        }
    }

    /// Legacy desktop search order, user directory first
    pub fn data_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.user_data_dir.clone()];
        dirs.extend(self.system_data_dirs.iter().cloned());
        dirs
    }

    pub fn cgroup_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cgroup_connect_timeout_ms)
    }

    pub fn cgroup_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.cgroup_idle_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.cgroup_connect_timeout_ms = self.cgroup_connect_timeout_ms.clamp(10, 30_000);
        self.cgroup_idle_secs = self.cgroup_idle_secs.max(1);
        self.watch_interval_ms = self.watch_interval_ms.max(10);
        if self.arch.as_deref().is_some_and(|a| a.is_empty()) {
            self.arch = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            (ENV_OOM_PROC_PATH, "/tmp/proc"),
            (ENV_SNAP_BASEDIR, "/tmp/snap"),
            (ENV_ARCH, ""),
            ("XDG_DATA_DIRS", "/a::/b"),
            ("XDG_DATA_HOME", "/home/me/.local/share"),
        ]
        .into_iter()
        .collect();

        let mut config = LaunchConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.proc_root, PathBuf::from("/tmp/proc"));
        assert_eq!(config.snap_basedir, Some(PathBuf::from("/tmp/snap")));
        assert_eq!(config.arch, None);
        assert_eq!(
            config.data_dirs(),
            vec![
                PathBuf::from("/home/me/.local/share"),
                PathBuf::from("/a"),
                PathBuf::from("/b")
            ]
        );
    }

    #[test]
    fn validate_clamps_timeouts() {
        let mut config = LaunchConfig {
            cgroup_connect_timeout_ms: 0,
            cgroup_idle_secs: 0,
            arch: Some(String::new()),
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.cgroup_connect_timeout_ms, 10);
        assert_eq!(config.cgroup_idle_secs, 1);
        assert_eq!(config.arch, None);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: LaunchConfig =
            serde_json::from_str(r#"{"supervisor":"Upstart","cgroup_idle_secs":60}"#)
                .expect("partial config parses");
        assert_eq!(config.supervisor, SupervisorFlavor::Upstart);
        assert_eq!(config.cgroup_idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.snap_root, PathBuf::from("/snap"));
    }
}
