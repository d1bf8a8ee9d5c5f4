use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Packages whose post-boot update usually means the host wants a reboot.
/// Used when the tweaks file does not name its own list.
const DEFAULT_REBOOT_PACKAGES: &[&str] = &[
    "kernel",
    "glibc",
    "linux-firmware",
    "systemd",
    "udev",
    "openssl-libs",
    "gnutls",
    "nss",
    "dbus",
];

/// Site-local overrides loaded from the `--tweaks` yaml file. All sections
/// are optional.
#[derive(Debug, Default, Deserialize)]
pub struct Tweaks {
    /// Definition id -> replacement text for its first child element.
    #[serde(default)]
    pub definition_fixes: BTreeMap<String, String>,
    /// Reference-id prefix -> severity that replaces the declared one.
    #[serde(default)]
    pub severity_changes: BTreeMap<String, String>,
    pub hint_reboot_packages: Option<Vec<String>>,
}

impl Tweaks {
    pub fn load(path: &Path) -> anyhow::Result<Tweaks> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let tweaks = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(tweaks)
    }

    pub fn reboot_packages(&self) -> Vec<String> {
        match &self.hint_reboot_packages {
            Some(pkgs) => pkgs.clone(),
            None => DEFAULT_REBOOT_PACKAGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_all_sections() {
        let yaml = r#"
definition_fixes:
  "oval:com.redhat.rhsa:def:20170001": "0:2.17-157.el7_3.1"
severity_changes:
  "RHSA-2017:1234": "Low"
hint_reboot_packages:
  - kernel
  - glibc
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let tweaks = Tweaks::load(file.path()).unwrap();
        assert_eq!(
            tweaks.definition_fixes["oval:com.redhat.rhsa:def:20170001"],
            "0:2.17-157.el7_3.1"
        );
        assert_eq!(tweaks.severity_changes["RHSA-2017:1234"], "Low");
        assert_eq!(tweaks.reboot_packages(), vec!["kernel", "glibc"]);
    }

    #[test]
    fn test_missing_sections_default() {
        let tweaks: Tweaks = serde_yaml::from_str("severity_changes:\n  CVE-2017: Ignore\n").unwrap();
        assert!(tweaks.definition_fixes.is_empty());
        assert_eq!(tweaks.severity_changes.len(), 1);
        // falls back to the built-in list
        let pkgs = tweaks.reboot_packages();
        assert!(pkgs.contains(&"kernel".to_string()));
        assert!(pkgs.contains(&"dbus".to_string()));
        assert_eq!(pkgs.len(), DEFAULT_REBOOT_PACKAGES.len());
    }

    #[test]
    fn test_unparseable_is_err() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definition_fixes: [not, a, mapping]\n").unwrap();
        assert!(Tweaks::load(file.path()).is_err());
    }
}
