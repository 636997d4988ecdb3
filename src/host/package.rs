//! Package-manager driven hosts: apt for Ubuntu/Debian, yum-cron for CentOS.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::files::{FILE_MODE_DEFAULT, FILE_MODE_SCRIPT, HostConfig};
use super::{Host, HostInfo, HostKind, UpgradeStatus, systemd};
use crate::error::{HostUpgradesError, Result};

const SCRIPT_NAME: &str = "host-upgrades.sh";

// unattended-upgrades.conf has to be loaded after apt.conf.d for its
// Allowed-Origins list to take effect, hence Dir::Etc::main.
const APT_CONF: &str = "Dir::Etc::main \"{config_path}\";\n";

const APT_SCRIPT: &str = r#"
set -ue

apt-get update

unattended-upgrade -v > $HOST_PATH/unattended-upgrade.out

if [ -e /run/reboot-required ]; then
	# preserve timestamp
	cp -a /run/reboot-required $HOST_PATH/reboot-required
fi
"#;

const YUM_SCRIPT: &str = r#"
set -ue

yum-cron ${CONFIG_PATH:-} | tee $HOST_PATH/yum-cron.out

needs-restarting -r > $HOST_PATH/needs-restarting.out || touch -a $HOST_PATH/needs-restarting.stamp
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageManager {
    Apt,
    Yum,
}

impl PackageManager {
    const fn for_kind(kind: HostKind) -> Self {
        match kind {
            HostKind::Ubuntu | HostKind::Debian => Self::Apt,
            HostKind::CentOS => Self::Yum,
        }
    }

    const fn config_file(self) -> &'static str {
        match self {
            Self::Apt => "unattended-upgrades.conf",
            Self::Yum => "yum-cron.conf",
        }
    }

    const fn script(self) -> &'static str {
        match self {
            Self::Apt => APT_SCRIPT,
            Self::Yum => YUM_SCRIPT,
        }
    }

    const fn log_file(self) -> &'static str {
        match self {
            Self::Apt => "unattended-upgrade.out",
            Self::Yum => "yum-cron.out",
        }
    }

    /// File whose presence (and mtime) signals a pending reboot.
    const fn reboot_stamp(self) -> &'static str {
        match self {
            Self::Apt => "reboot-required",
            Self::Yum => "needs-restarting.stamp",
        }
    }

    const fn reboot_message(self) -> &'static str {
        match self {
            Self::Apt => "reboot-required",
            Self::Yum => "needs-restarting.out",
        }
    }
}

#[derive(Debug, Clone)]
struct Configured {
    files: HostConfig,
    script_path: PathBuf,
    env: Vec<(&'static str, String)>,
}

/// A host upgraded by running its package manager through a shell script.
#[derive(Debug, Clone)]
pub struct PackageHost {
    kind: HostKind,
    manager: PackageManager,
    info: HostInfo,
    configured: Option<Configured>,
}

impl PackageHost {
    pub const fn new(kind: HostKind, info: HostInfo) -> Self {
        Self {
            kind,
            manager: PackageManager::for_kind(kind),
            info,
            configured: None,
        }
    }

    pub const fn kind(&self) -> HostKind {
        self.kind
    }

    fn configured(&self) -> Result<&Configured> {
        self.configured
            .as_ref()
            .ok_or_else(|| HostUpgradesError::Host(format!("{} host is not configured", self.kind)))
    }

    /// Read back the output files written by the upgrade script.
    fn read_status(&self, files: &HostConfig) -> Result<UpgradeStatus> {
        let mut status = UpgradeStatus {
            upgrade_log: files.read_host_file(self.manager.log_file())?,
            ..Default::default()
        };

        if let Some(since) = files.stat_host_file(self.manager.reboot_stamp())? {
            status.reboot_required = true;
            status.reboot_required_since = Some(since);
            status.reboot_required_message = files.read_host_file(self.manager.reboot_message())?;
        }

        Ok(status)
    }
}

impl fmt::Display for PackageHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.info.operating_system, self.info.operating_system_release)
    }
}

#[async_trait]
impl Host for PackageHost {
    fn info(&self) -> &HostInfo {
        &self.info
    }

    async fn configure(&mut self, config: &HostConfig) -> Result<()> {
        let host_path = config.mount().display().to_string();
        info!(host = %self, host_path = %host_path, "Using host path for output files");

        let config_file = self.manager.config_file();
        let copied = if config.file_exists(config_file)? {
            let path = config.copy_host_file(config_file)?;
            info!(host = %self, path = %path.display(), "Using copied {}", config_file);
            Some(path.display().to_string())
        } else {
            info!(host = %self, "No {} configured", config_file);
            None
        };

        let mut env = vec![("HOST_PATH", host_path)];

        match (self.manager, copied) {
            (PackageManager::Apt, Some(config_path)) => {
                let apt_conf = APT_CONF.replace("{config_path}", &config_path);
                let path = config.write_host_file("apt.conf", apt_conf.as_bytes(), FILE_MODE_DEFAULT)?;
                env.push(("APT_CONFIG", path.display().to_string()));
            }
            (PackageManager::Apt, None) => {}
            (PackageManager::Yum, config_path) => {
                env.push(("CONFIG_PATH", config_path.unwrap_or_default()));
            }
        }

        let script_path =
            config.write_host_file(SCRIPT_NAME, self.manager.script().as_bytes(), FILE_MODE_SCRIPT)?;
        info!(host = %self, path = %script_path.display(), "Using generated upgrade script");

        self.configured = Some(Configured {
            files: config.clone(),
            script_path,
            env,
        });

        Ok(())
    }

    async fn upgrade(&self) -> Result<UpgradeStatus> {
        let configured = self.configured()?;
        let cmd = vec![
            "/bin/sh".to_string(),
            "-x".to_string(),
            configured.script_path.display().to_string(),
        ];

        info!(host = %self, "Running host upgrade");
        systemd::exec(systemd::UNIT, &configured.env, &cmd).await?;

        self.read_status(&configured.files)
            .map_err(|e| HostUpgradesError::Upgrade(format!("Failed to read upgrade output: {}", e)))
    }

    async fn reboot(&self) -> Result<()> {
        systemd::reboot().await
    }
}
