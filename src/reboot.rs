use std::fs;

use anyhow::Context;
use tokio::process::Command;

const QUERY_FORMAT: &str = "%{NAME}|%{INSTALLTIME}|%{NVRA}\n";

#[derive(Debug, PartialEq)]
pub struct InstalledPackage {
    pub name: String,
    pub install_time: u64,
    pub nvra: String,
}

/// Returns the nvra of every listed package that was installed after the
/// last boot. An empty return means no reboot hint.
pub async fn stale_reboot_packages(packages: &[String]) -> anyhow::Result<Vec<String>> {
    if packages.is_empty() {
        return Ok(Vec::new());
    }
    let boot_time = read_boot_time()?;
    let output = Command::new("rpm")
        .arg("-q")
        .arg("--qf")
        .arg(QUERY_FORMAT)
        .args(packages)
        .output()
        .await
        .context("running rpm -q")?;

    // rpm exits non-zero when any queried package is absent; stdout still
    // carries the installed ones, so only the output is inspected
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stale_packages(&parse_query_output(&stdout), boot_time))
}

/// Parses `NAME|INSTALLTIME|NVRA` lines, skipping anything else (rpm prints
/// "package foo is not installed" for absent names).
pub fn parse_query_output(out: &str) -> Vec<InstalledPackage> {
    let mut packages = Vec::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.trim().split('|').collect();
        if fields.len() != 3 {
            continue;
        }
        let Ok(install_time) = fields[1].parse::<u64>() else {
            continue;
        };
        packages.push(InstalledPackage {
            name: fields[0].to_string(),
            install_time,
            nvra: fields[2].to_string(),
        });
    }
    packages
}

pub fn stale_packages(installed: &[InstalledPackage], boot_time: u64) -> Vec<String> {
    let mut stale = Vec::new();
    for pkg in installed {
        if pkg.install_time > boot_time {
            log::info!("core package {} updated, system needs reboot", pkg.nvra);
            stale.push(pkg.nvra.clone());
        }
    }
    stale
}

fn read_boot_time() -> anyhow::Result<u64> {
    let stat = fs::read_to_string("/proc/stat").context("reading /proc/stat")?;
    parse_boot_time(&stat).context("no btime in /proc/stat")
}

/// Boot time in epoch seconds from /proc/stat content.
pub fn parse_boot_time(stat: &str) -> Option<u64> {
    stat.lines().find_map(|line| {
        let rest = line.strip_prefix("btime ")?;
        rest.trim().parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_output_skips_noise() {
        let out = "kernel|1490000000|kernel-3.10.0-514.10.2.el7.x86_64\n\
                   package linux-firmware is not installed\n\
                   glibc|1480000000|glibc-2.17-157.el7_3.1.x86_64\n";
        let pkgs = parse_query_output(out);
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[0].name, "kernel");
        assert_eq!(pkgs[0].install_time, 1490000000);
        assert_eq!(pkgs[1].nvra, "glibc-2.17-157.el7_3.1.x86_64");
    }

    #[test]
    fn test_parse_boot_time() {
        let stat = "cpu  2255 34 2290 22625563\n\
                    btime 1485123456\n\
                    processes 401389\n";
        assert_eq!(parse_boot_time(stat), Some(1485123456));
        assert_eq!(parse_boot_time("cpu 1 2 3\n"), None);
    }

    #[test]
    fn test_stale_packages_strictly_after_boot() {
        let installed = vec![
            InstalledPackage {
                name: "kernel".to_string(),
                install_time: 1490000001,
                nvra: "kernel-3.10.0-514.10.2.el7.x86_64".to_string(),
            },
            InstalledPackage {
                name: "glibc".to_string(),
                install_time: 1490000000,
                nvra: "glibc-2.17-157.el7_3.1.x86_64".to_string(),
            },
        ];
        let stale = stale_packages(&installed, 1490000000);
        assert_eq!(stale, vec!["kernel-3.10.0-514.10.2.el7.x86_64"]);
    }
}
