//! Environment handed to launched jobs
//!
//! Applications receive `APP_ID`, `APP_URIS`, `APP_EXEC`, `APP_DIR` and
//! `UBUNTU_APP_LAUNCH_ARCH`. Helpers additionally get `HELPER_TYPE` and
//! `INSTANCE_ID`, and session helpers a demangling token.

use std::path::Path;

use super::appid::AppId;

pub const APP_ID: &str = "APP_ID";
pub const APP_URIS: &str = "APP_URIS";
pub const APP_EXEC: &str = "APP_EXEC";
pub const APP_DIR: &str = "APP_DIR";
pub const INSTANCE_ID: &str = "INSTANCE_ID";
pub const HELPER_TYPE: &str = "HELPER_TYPE";
pub const ARCH: &str = "UBUNTU_APP_LAUNCH_ARCH";
pub const DEMANGLE_NAME: &str = "UBUNTU_APP_LAUNCH_DEMANGLE_NAME";
pub const TESTABILITY: &str = "QT_LOAD_TESTABILITY";
pub const PATH: &str = "PATH";
pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";
pub const QML2_IMPORT_PATH: &str = "QML2_IMPORT_PATH";

/// Ordered `KEY=value` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    vars: Vec<(String, String)>,
}

impl LaunchEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an earlier value
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key.to_string(), value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Base variables every job gets
    pub fn for_job(app_id: &AppId, instance_id: &str, urls: &[String]) -> Self {
        let mut env = Self::new();
        env.set(APP_ID, app_id.to_string());
        env.set(INSTANCE_ID, instance_id);
        if !urls.is_empty() {
            env.set(APP_URIS, quote_uris(urls));
        }
        env
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// `KEY=value` strings in insertion order
    pub fn to_strings(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Parse `KEY=value` strings, skipping entries without `=`
    pub fn from_strings<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut env = Self::new();
        for entry in entries {
            if let Some((k, v)) = entry.as_ref().split_once('=') {
                env.set(k, v);
            }
        }
        env
    }
}

/// Quote one argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@%+,".contains(&b))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// The value of `APP_URIS`: each URI shell-quoted, space separated
pub fn quote_uris(urls: &[String]) -> String {
    urls.iter()
        .map(|u| shell_quote(u))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Search paths after folding in an application directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPaths {
    pub path: Option<String>,
    pub ld_library_path: Option<String>,
    pub qml2_import_path: Option<String>,
}

impl SearchPaths {
    /// Export every composed path into `env`
    pub fn apply(&self, env: &mut LaunchEnv) {
        for (key, value) in [
            (PATH, &self.path),
            (LD_LIBRARY_PATH, &self.ld_library_path),
            (QML2_IMPORT_PATH, &self.qml2_import_path),
        ] {
            if let Some(value) = value {
                env.set(key, value.as_str());
            }
        }
    }
}

fn join_nonempty(parts: &[Option<&str>]) -> Option<String> {
    let parts: Vec<&str> = parts.iter().flatten().copied().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(":"))
    }
}

/// Compose `PATH`, `LD_LIBRARY_PATH` and `QML2_IMPORT_PATH` for `app_dir`.
///
/// An app dir or architecture containing `:` is ignored, as it would corrupt
/// the search path. Empty inputs count as unset.
pub fn compose_search_paths(
    app_dir: Option<&str>,
    arch: Option<&str>,
    path: Option<&str>,
    ld_library_path: Option<&str>,
    qml2_import_path: Option<&str>,
) -> SearchPaths {
    let app_dir = app_dir.filter(|d| !d.is_empty() && !d.contains(':'));
    let arch = arch.filter(|a| !a.is_empty() && !a.contains(':'));
    let path = path.filter(|p| !p.is_empty());
    let ld = ld_library_path.filter(|p| !p.is_empty());
    let qml = qml2_import_path.filter(|p| !p.is_empty());

    let Some(dir) = app_dir else {
        return SearchPaths {
            path: path.map(String::from),
            ld_library_path: ld.map(String::from),
            qml2_import_path: qml.map(String::from),
        };
    };

    match arch {
        Some(arch) => {
            let arch_lib = format!("{}/lib/{}", dir, arch);
            let arch_bin = format!("{}/bin", arch_lib);
            let lib = format!("{}/lib", dir);
            SearchPaths {
                path: join_nonempty(&[Some(arch_bin.as_str()), Some(dir), path]),
                ld_library_path: join_nonempty(&[Some(arch_lib.as_str()), Some(lib.as_str()), ld]),
                qml2_import_path: join_nonempty(&[qml, Some(arch_lib.as_str())]),
            }
        }
        None => {
            let lib = format!("{}/lib", dir);
            SearchPaths {
                path: join_nonempty(&[Some(dir), path]),
                ld_library_path: join_nonempty(&[Some(lib.as_str()), ld]),
                qml2_import_path: qml.map(String::from),
            }
        }
    }
}

/// Identity of a running helper, read back from its own environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperContext {
    pub helper_type: String,
    pub app_id: AppId,
    pub instance_id: String,
    pub demangle_name: Option<String>,
}

impl HelperContext {
    /// Read the helper identity the launcher placed in the environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let helper_type = lookup(HELPER_TYPE).filter(|t| !t.is_empty())?;
        let app_id = AppId::parse(&lookup(APP_ID)?);
        if app_id.is_empty() {
            return None;
        }
        Some(Self {
            helper_type,
            app_id,
            instance_id: lookup(INSTANCE_ID).unwrap_or_default(),
            demangle_name: lookup(DEMANGLE_NAME).filter(|n| !n.is_empty()),
        })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Variables a helper pushes into its own job when it sets its exec line
pub fn helper_exec_env(
    exec: &str,
    dir: Option<&Path>,
    demangle_name: Option<&str>,
    demangler: &Path,
) -> LaunchEnv {
    let mut env = LaunchEnv::new();
    match demangle_name {
        Some(_) => env.set(APP_EXEC, format!("{} {}", demangler.display(), exec)),
        None => env.set(APP_EXEC, exec),
    };
    if let Some(dir) = dir {
        env.set(APP_DIR, dir.display().to_string());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("http://example.com/a"), "http://example.com/a");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(
            quote_uris(&["file:///a b".to_string(), "x".to_string()]),
            "'file:///a b' x"
        );
    }

    #[test]
    fn search_paths_with_arch() {
        let paths = compose_search_paths(
            Some("/app"),
            Some("x86_64-linux-gnu"),
            Some("/usr/bin"),
            Some("/usr/lib"),
            Some("/qml"),
        );
        assert_eq!(
            paths.path.as_deref(),
            Some("/app/lib/x86_64-linux-gnu/bin:/app:/usr/bin")
        );
        assert_eq!(
            paths.ld_library_path.as_deref(),
            Some("/app/lib/x86_64-linux-gnu:/app/lib:/usr/lib")
        );
        assert_eq!(
            paths.qml2_import_path.as_deref(),
            Some("/qml:/app/lib/x86_64-linux-gnu")
        );
    }

    #[test]
    fn search_paths_without_arch() {
        let paths = compose_search_paths(Some("/app"), None, Some("/usr/bin"), None, Some(""));
        assert_eq!(paths.path.as_deref(), Some("/app:/usr/bin"));
        assert_eq!(paths.ld_library_path.as_deref(), Some("/app/lib"));
        assert_eq!(paths.qml2_import_path, None);
    }

    #[test]
    fn search_paths_ignore_colon_dirs() {
        let paths = compose_search_paths(Some("/a:b"), Some("arch"), Some("/usr/bin"), None, None);
        assert_eq!(paths.path.as_deref(), Some("/usr/bin"));
        assert_eq!(paths.ld_library_path, None);

        let arch_colon = compose_search_paths(Some("/app"), Some("a:b"), None, None, Some("/q"));
        assert_eq!(arch_colon.path.as_deref(), Some("/app"));
        assert_eq!(arch_colon.qml2_import_path.as_deref(), Some("/q"));
    }

    #[test]
    fn launch_env_round_trip_strings() {
        let id = AppId::parse("com.test.good_application_1.2.3");
        let env = LaunchEnv::for_job(&id, "42", &["a b".to_string()]);
        let strings = env.to_strings();
        assert_eq!(strings[0], "APP_ID=com.test.good_application_1.2.3");
        assert_eq!(LaunchEnv::from_strings(&strings[..]).get(APP_URIS), Some("'a b'"));
    }

    #[test]
    fn helper_exec_with_demangler() {
        let env = helper_exec_env(
            "helper --flag",
            Some(Path::new("/work")),
            Some("/tmp/socket"),
            &PathBuf::from("/usr/lib/demangler"),
        );
        assert_eq!(env.get(APP_EXEC), Some("/usr/lib/demangler helper --flag"));
        assert_eq!(env.get(APP_DIR), Some("/work"));

        let plain = helper_exec_env("helper", None, None, Path::new("/d"));
        assert_eq!(plain.get(APP_EXEC), Some("helper"));
        assert_eq!(plain.get(APP_DIR), None);
    }

    #[test]
    fn helper_context_requires_type_and_id() {
        let vars: HashMap<&str, &str> = [
            (HELPER_TYPE, "untrusted-helper"),
            (APP_ID, "com.bar_foo_8432.13.1"),
            (INSTANCE_ID, "24034582324132"),
        ]
        .into_iter()
        .collect();
        let ctx = HelperContext::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
            .expect("context from env");
        assert_eq!(ctx.helper_type, "untrusted-helper");
        assert_eq!(ctx.instance_id, "24034582324132");
        assert_eq!(ctx.demangle_name, None);

        assert!(HelperContext::from_lookup(|_| None).is_none());
    }
}
