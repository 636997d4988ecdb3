//! OS identification and boot time from `/etc/os-release` and `/proc`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{HostUpgradesError, Result};

/// The subset of `os-release(5)` used to pick a host implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
    pub pretty_name: String,
}

impl OsRelease {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HostUpgradesError::Host(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let fields: HashMap<&str, String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), unquote(value.trim())))
            .collect();

        let field = |key: &str| fields.get(key).cloned().unwrap_or_default();

        Self {
            id: field("ID"),
            version_id: field("VERSION_ID"),
            pretty_name: field("PRETTY_NAME"),
        }
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
        .to_string()
}

/// Kernel name and release, e.g. `("Linux", "6.8.0-45-generic")`.
pub fn read_kernel(proc_root: &Path) -> Result<(String, String)> {
    let read = |name: &str| {
        let path = proc_root.join("sys/kernel").join(name);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| HostUpgradesError::Host(format!("Failed to read {}: {}", path.display(), e)))
    };

    Ok((read("ostype")?, read("osrelease")?))
}

/// Boot time of the running kernel, from `/proc/stat`.
pub fn read_boot_time(proc_root: &Path) -> Result<DateTime<Utc>> {
    let path = proc_root.join("stat");
    let content = fs::read_to_string(&path).map_err(|e| {
        HostUpgradesError::Host(format!("Failed to read {}: {}", path.display(), e))
    })?;
    parse_boot_time(&content)
}

pub fn parse_boot_time(stat: &str) -> Result<DateTime<Utc>> {
    let value = stat
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .ok_or_else(|| HostUpgradesError::Host("Missing btime in /proc/stat".to_string()))?;

    let secs: i64 = value.trim().parse().map_err(|e| {
        HostUpgradesError::Host(format!("Invalid /proc/stat btime {:?}: {}", value.trim(), e))
    })?;

    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| HostUpgradesError::Host(format!("Invalid /proc/stat btime {}", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UBUNTU: &str = r#"PRETTY_NAME="Ubuntu 22.04.4 LTS"
NAME="Ubuntu"
VERSION_ID="22.04"
VERSION="22.04.4 LTS (Jammy Jellyfish)"
ID=ubuntu
ID_LIKE=debian
"#;

    #[test]
    fn test_parse_os_release() {
        let release = OsRelease::parse(UBUNTU);
        assert_eq!(release.id, "ubuntu");
        assert_eq!(release.version_id, "22.04");
        assert_eq!(release.pretty_name, "Ubuntu 22.04.4 LTS");
    }

    #[test]
    fn test_parse_os_release_single_quotes_and_comments() {
        let release = OsRelease::parse("# comment\nID='centos'\nVERSION_ID='7'\n\n");
        assert_eq!(release.id, "centos");
        assert_eq!(release.version_id, "7");
        assert_eq!(release.pretty_name, "");
    }

    #[test]
    fn test_parse_boot_time() {
        let stat = "cpu  1 2 3 4\nintr 100\nctxt 200\nbtime 1700000000\nprocesses 42\n";
        let boot = parse_boot_time(stat).unwrap();
        assert_eq!(boot.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_boot_time_missing() {
        let err = parse_boot_time("cpu 1 2 3\n").unwrap_err();
        assert!(err.to_string().contains("Missing btime"));
    }

    #[test]
    fn test_parse_boot_time_invalid() {
        assert!(parse_boot_time("btime soon\n").is_err());
    }

    #[test]
    fn test_read_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("sys/kernel");
        fs::create_dir_all(&kernel).unwrap();
        fs::write(kernel.join("ostype"), "Linux\n").unwrap();
        fs::write(kernel.join("osrelease"), "6.8.0-45-generic\n").unwrap();

        let (name, release) = read_kernel(dir.path()).unwrap();
        assert_eq!(name, "Linux");
        assert_eq!(release, "6.8.0-45-generic");
    }
}
