//! Minimal reader for the `[Desktop Entry]` group of a desktop file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Keys this crate cares about from a desktop file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesktopEntry {
    pub name: String,
    pub icon: Option<String>,
    pub exec: String,
    pub path: Option<PathBuf>,
    pub no_display: bool,
    pub single_instance: Option<bool>,
}

impl DesktopEntry {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read desktop file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid desktop file {}", path.display()))
    }

    /// Parse the key-file text. Localized keys are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut entry = Self::default();
        let mut in_group = false;
        let mut seen_group = false;
        let mut kind = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                in_group = line == "[Desktop Entry]";
                seen_group |= in_group;
                continue;
            }
            if !in_group {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Name" => entry.name = value.to_string(),
                "Icon" if !value.is_empty() => entry.icon = Some(value.to_string()),
                "Exec" => entry.exec = value.to_string(),
                "Path" if !value.is_empty() => entry.path = Some(PathBuf::from(value)),
                "NoDisplay" => entry.no_display = value == "true",
                "X-Ubuntu-Single-Instance" => entry.single_instance = Some(value == "true"),
                "Type" => kind = Some(value.to_string()),
                _ => {}
            }
        }

        if !seen_group {
            anyhow::bail!("Missing [Desktop Entry] group");
        }
        if let Some(kind) = kind.filter(|k| k != "Application") {
            anyhow::bail!("Desktop entry type is '{}', not Application", kind);
        }
        if entry.exec.is_empty() {
            anyhow::bail!("Desktop entry has no Exec key");
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_main_group_only() {
        let entry = DesktopEntry::parse(
            "# comment\n[Desktop Entry]\nType=Application\nName=Foo\nName[fr]=Fou\nExec=foo %U\nIcon=foo\nPath=/tmp\nX-Ubuntu-Single-Instance=true\n\n[Desktop Action New]\nExec=other\n",
        )
        .expect("valid entry");
        assert_eq!(entry.name, "Foo");
        assert_eq!(entry.exec, "foo %U");
        assert_eq!(entry.icon.as_deref(), Some("foo"));
        assert_eq!(entry.path, Some(PathBuf::from("/tmp")));
        assert_eq!(entry.single_instance, Some(true));
        assert!(!entry.no_display);
    }

    #[test]
    fn rejects_incomplete_entries() {
        assert!(DesktopEntry::parse("Name=Foo\nExec=foo").is_err());
        assert!(DesktopEntry::parse("[Desktop Entry]\nName=Foo\n").is_err());
        assert!(DesktopEntry::parse("[Desktop Entry]\nType=Link\nExec=foo\n").is_err());
    }
}
