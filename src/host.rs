//! The machine being upgraded: OS probing, package upgrades and reboot.

pub mod files;
pub mod package;
pub mod probe;
pub mod systemd;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{HostUpgradesError, Result};

pub use files::HostConfig;
pub use package::PackageHost;
pub use probe::OsRelease;

/// Static host information, probed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub operating_system: String,
    pub operating_system_release: String,
    pub kernel: String,
    pub kernel_release: String,
    /// Boot time of the running kernel instance.
    pub boot_time: DateTime<Utc>,
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} {})",
            self.operating_system, self.operating_system_release, self.kernel, self.kernel_release
        )
    }
}

/// Result of a successful upgrade run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeStatus {
    pub reboot_required: bool,
    pub reboot_required_since: Option<DateTime<Utc>>,
    pub reboot_required_message: String,
    pub upgrade_log: String,
}

#[async_trait]
pub trait Host: Send + Sync {
    fn info(&self) -> &HostInfo;

    /// Install config files and the upgrade script into the host mount.
    async fn configure(&mut self, config: &HostConfig) -> Result<()>;

    /// Run the package upgrade on the host. Not cancellable once started.
    async fn upgrade(&self) -> Result<UpgradeStatus>;

    /// Request a host reboot. Returns before the host goes down.
    async fn reboot(&self) -> Result<()>;
}

/// Supported operating systems, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Ubuntu,
    Debian,
    CentOS,
}

impl HostKind {
    pub const ALL: [Self; 3] = [Self::Ubuntu, Self::Debian, Self::CentOS];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Ubuntu => "Ubuntu",
            Self::Debian => "Debian",
            Self::CentOS => "CentOS",
        }
    }

    const fn os_release_id(self) -> &'static str {
        match self {
            Self::Ubuntu => "ubuntu",
            Self::Debian => "debian",
            Self::CentOS => "centos",
        }
    }

    pub fn matches(self, release: &OsRelease) -> bool {
        release.id == self.os_release_id()
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the first host implementation matching the running OS.
pub fn probe(os_release_path: &Path, proc_root: &Path) -> Result<PackageHost> {
    let release = OsRelease::read(os_release_path)?;

    let Some(kind) = HostKind::ALL.into_iter().find(|kind| {
        let matched = kind.matches(&release);
        if !matched {
            debug!(host = %kind, os_id = %release.id, "Host probe mismatch");
        }
        matched
    }) else {
        return Err(HostUpgradesError::Host(format!(
            "No host implementation matches {:?} (ID={})",
            release.pretty_name, release.id
        )));
    };

    let (kernel, kernel_release) = probe::read_kernel(proc_root)?;
    let boot_time = probe::read_boot_time(proc_root)?;

    let info = HostInfo {
        operating_system: kind.name().to_string(),
        operating_system_release: release.version_id,
        kernel,
        kernel_release,
        boot_time,
    };

    info!(
        host = %info,
        boot_time = %info.boot_time,
        "Probed host"
    );

    Ok(PackageHost::new(kind, info))
}
