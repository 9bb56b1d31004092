//! Application identifiers - the `package_appname_version` triplet
//!
//! An [`AppId`] is either full (all three parts present) or the empty
//! sentinel returned when parsing or discovery fails. Discovery runs the same
//! algorithm over any ordered list of [`PackageLookup`] implementations.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PACKAGE: &str = r"[a-zA-Z0-9][a-zA-Z0-9+.-]*";
const APPNAME: &str = r"[a-zA-Z0-9+.-]+";
const VERSION: &str = r"[a-zA-Z0-9+.~-]+";

fn anchored(parts: &[&str]) -> Regex {
    let body = parts
        .iter()
        .map(|p| format!("({})", p))
        .collect::<Vec<_>>()
        .join("_");
    Regex::new(&format!("^{}$", body)).expect("application id pattern is valid")
}

/// Grammar for the canonical three-part form.
static APP_ID_PATTERN: Lazy<Regex> = Lazy::new(|| anchored(&[PACKAGE, APPNAME, VERSION]));
static PACKAGE_PATTERN: Lazy<Regex> = Lazy::new(|| anchored(&[PACKAGE]));
static APPNAME_PATTERN: Lazy<Regex> = Lazy::new(|| anchored(&[APPNAME]));
static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| anchored(&[VERSION]));

/// The (package, application, version) triplet that identifies a launchable unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppId {
    package: String,
    appname: String,
    version: String,
}

impl AppId {
    /// Build an id from its parts. A part that is empty or outside the
    /// segment grammar (a `_` in a name, say) yields the empty id.
    pub fn new(
        package: impl Into<String>,
        appname: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let id = Self {
            package: package.into(),
            appname: appname.into(),
            version: version.into(),
        };
        if PACKAGE_PATTERN.is_match(&id.package)
            && APPNAME_PATTERN.is_match(&id.appname)
            && VERSION_PATTERN.is_match(&id.version)
        {
            id
        } else {
            Self::empty()
        }
    }

    /// The failure sentinel
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.package.is_empty()
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn appname(&self) -> &str {
        &self.appname
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Parse the canonical `package_appname_version` form.
    ///
    /// Returns the empty id for anything else. Escaped ids from
    /// [`AppId::dbus_id`] only parse here when the escaped text is itself a
    /// canonical triplet (`a_5fb_5fc`); use [`AppId::parse_dbus_id`] to
    /// decode them.
    pub fn parse(s: &str) -> Self {
        match APP_ID_PATTERN.captures(s) {
            Some(caps) => Self::new(&caps[1], &caps[2], &caps[3]),
            None => Self::empty(),
        }
    }

    /// Whether `s` is a canonical application id
    pub fn valid(s: &str) -> bool {
        !Self::parse(s).is_empty()
    }

    /// Escape the canonical form for use as an IPC object path segment.
    ///
    /// Every byte outside `[a-zA-Z0-9]` becomes `_` followed by two lowercase
    /// hex digits.
    pub fn dbus_id(&self) -> String {
        let canonical = self.to_string();
        let mut out = String::with_capacity(canonical.len() * 2);
        for byte in canonical.bytes() {
            if byte.is_ascii_alphanumeric() {
                out.push(byte as char);
            } else {
                out.push_str(&format!("_{:02x}", byte));
            }
        }
        out
    }

    /// Inverse of [`AppId::dbus_id`]. Rejects anything `dbus_id` could not
    /// have produced.
    pub fn parse_dbus_id(s: &str) -> Self {
        match decode_dbus(s) {
            Some(decoded) => {
                let id = match APP_ID_PATTERN.captures(&decoded) {
                    Some(caps) => Self::new(&caps[1], &caps[2], &caps[3]),
                    None => return Self::empty(),
                };
                if !id.is_empty() && id.dbus_id() == s {
                    id
                } else {
                    Self::empty()
                }
            }
            None => Self::empty(),
        }
    }

    /// `package_appname`, stable across upgrades
    pub fn persistent_id(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("{}_{}", self.package, self.appname)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}_{}_{}", self.package, self.appname, self.version)
    }
}

fn decode_dbus(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let hex = s.get(i + 1..i + 3)?;
                if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
                    return None;
                }
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

/// Policy for picking an application when a package declares several
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ApplicationWildcard {
    #[default]
    FirstListed,
    LastListed,
    OnlyListed,
}

impl ApplicationWildcard {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::FirstListed => "first-listed-app",
            Self::LastListed => "last-listed-app",
            Self::OnlyListed => "only-listed-app",
        }
    }

    /// Map the appname keywords accepted by the control surface
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "first-listed-app" => Some(Self::FirstListed),
            "last-listed-app" => Some(Self::LastListed),
            "only-listed-app" => Some(Self::OnlyListed),
            _ => None,
        }
    }

    /// Pick from the declared application names, in declaration order
    pub fn select(&self, names: &[String]) -> Option<String> {
        match self {
            Self::FirstListed => names.first().cloned(),
            Self::LastListed => names.last().cloned(),
            Self::OnlyListed if names.len() == 1 => names.first().cloned(),
            Self::OnlyListed => None,
        }
    }
}

/// The lookups discovery needs from a package backend
pub trait PackageLookup {
    fn verify_package(&self, package: &str) -> bool;

    /// Applications declared by the package, in declaration order
    fn app_names(&self, package: &str) -> Vec<String>;

    fn verify_appname(&self, package: &str, appname: &str) -> bool {
        self.app_names(package).iter().any(|name| name == appname)
    }

    fn find_appname(&self, package: &str, wildcard: ApplicationWildcard) -> Option<String> {
        wildcard.select(&self.app_names(package))
    }

    fn find_version(&self, package: &str, appname: &str) -> Option<String>;

    fn has_app_id(&self, id: &AppId) -> bool;
}

/// Resolve a possibly partial identifier against `backends`, first match wins.
///
/// An explicit version is verified with [`PackageLookup::has_app_id`] and is
/// never looked up.
pub fn discover_in<B: PackageLookup>(
    backends: &[B],
    package: &str,
    appname: Option<&str>,
    version: Option<&str>,
    wildcard: ApplicationWildcard,
) -> AppId {
    if package.is_empty() {
        return AppId::empty();
    }

    let Some(backend) = backends.iter().find(|b| b.verify_package(package)) else {
        warn!("Package '{}' not found in any backend", package);
        return AppId::empty();
    };

    let appname = match appname.filter(|a| !a.is_empty()) {
        Some(name) => {
            if !backend.verify_appname(package, name) {
                warn!("Package '{}' has no application '{}'", package, name);
                return AppId::empty();
            }
            name.to_string()
        }
        None => match backend.find_appname(package, wildcard) {
            Some(name) => name,
            None => {
                debug!(
                    "No application in '{}' matches {}",
                    package,
                    wildcard.keyword()
                );
                return AppId::empty();
            }
        },
    };

    match version.filter(|v| !v.is_empty()) {
        Some(version) => {
            let id = AppId::new(package, &appname, version);
            if !id.is_empty() && backend.has_app_id(&id) {
                id
            } else {
                warn!("Application id '{}' is not installed", id);
                AppId::empty()
            }
        }
        None => match backend.find_version(package, &appname) {
            Some(version) => AppId::new(package, appname, version),
            None => {
                warn!("No version for '{}' application '{}'", package, appname);
                AppId::empty()
            }
        },
    }
}
