use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::{HostUpgradesError, Result};
use crate::scheduler::parse_schedule;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "host-upgrades",
    version,
    about = "Unattended OS package upgrades for Kubernetes nodes, one node at a time"
)]
pub struct Config {
    /// Cron schedule for upgrades (5-field, 6/7-field with seconds, or @daily); runs once if unset
    #[arg(long, env = "SCHEDULE")]
    pub schedule: Option<String>,

    /// Seconds after each scheduled time during which an upgrade may still start (0 = unlimited)
    #[arg(long, env = "SCHEDULE_WINDOW_SECONDS", default_value = "3600")]
    pub schedule_window_seconds: u64,

    /// Reboot the host when an upgrade requires it
    #[arg(long, env = "REBOOT", default_value = "false")]
    pub reboot: bool,

    /// Seconds to wait for the host to shut down after requesting a reboot
    #[arg(long, env = "REBOOT_TIMEOUT_SECONDS", default_value = "300")]
    pub reboot_timeout_seconds: u64,

    /// Drain the node before rebooting
    #[arg(long, env = "DRAIN", default_value = "false")]
    pub drain: bool,

    /// Seconds allowed for evicting all pods from the node
    #[arg(long, env = "DRAIN_TIMEOUT_SECONDS", default_value = "300")]
    pub drain_timeout_seconds: u64,

    /// Namespace of the daemonset used as the fleet lock
    #[arg(long, env = "KUBE_NAMESPACE")]
    pub kube_namespace: Option<String>,

    /// Name of the daemonset used as the fleet lock
    #[arg(long, env = "KUBE_DAEMONSET")]
    pub kube_daemonset: Option<String>,

    /// Name of the node this host runs as
    #[arg(long, env = "KUBE_NODE")]
    pub kube_node: Option<String>,

    /// Directory with optional unattended-upgrades.conf / yum-cron.conf
    #[arg(long, env = "CONFIG_PATH", default_value = "/etc/host-upgrades")]
    pub config_path: PathBuf,

    /// Host directory bind-mounted into the container, shared with upgrade scripts
    #[arg(long, env = "HOST_MOUNT", default_value = "/run/host-upgrades")]
    pub host_mount: PathBuf,

    /// Path to the host's os-release file
    #[arg(long, env = "OS_RELEASE_PATH", default_value = "/etc/os-release")]
    pub os_release_path: PathBuf,

    /// Port for /healthz and /readyz (0 = disabled)
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Reject inconsistent flag combinations before anything touches the
    /// host or the cluster.
    pub fn validate(&self) -> Result<()> {
        if let Some(schedule) = &self.schedule {
            parse_schedule(schedule)?;
        }

        if self.kube_namespace.is_some() != self.kube_daemonset.is_some() {
            return Err(HostUpgradesError::Config(
                "--kube-namespace and --kube-daemonset must be given together".to_string(),
            ));
        }
        if self.kube_daemonset.is_some() && self.kube_node.is_none() {
            return Err(HostUpgradesError::Config(
                "--kube-daemonset requires --kube-node".to_string(),
            ));
        }

        if self.drain && !self.reboot {
            return Err(HostUpgradesError::Config(
                "--drain requires --reboot".to_string(),
            ));
        }
        if self.drain && self.kube_node.is_none() {
            return Err(HostUpgradesError::Config(
                "--drain requires --kube-node".to_string(),
            ));
        }

        Ok(())
    }

    pub fn schedule_window(&self) -> Option<Duration> {
        (self.schedule_window_seconds > 0).then(|| Duration::from_secs(self.schedule_window_seconds))
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    /// Namespace and name of the lock daemonset, if locking is configured.
    pub fn lock_target(&self) -> Option<(&str, &str)> {
        Some((self.kube_namespace.as_deref()?, self.kube_daemonset.as_deref()?))
    }

    pub fn display(&self) {
        tracing::info!(
            schedule = self.schedule.as_deref().unwrap_or("NONE (run once)"),
            schedule_window_seconds = self.schedule_window_seconds,
            reboot = self.reboot,
            reboot_timeout_seconds = self.reboot_timeout_seconds,
            drain = self.drain,
            drain_timeout_seconds = self.drain_timeout_seconds,
            kube_namespace = self.kube_namespace.as_deref().unwrap_or(""),
            kube_daemonset = self.kube_daemonset.as_deref().unwrap_or(""),
            kube_node = self.kube_node.as_deref().unwrap_or(""),
            config_path = %self.config_path.display(),
            host_mount = %self.host_mount.display(),
            health_port = self.health_port,
            "Configuration initialized"
        );

        if self.kube_node.is_none() {
            tracing::warn!("No --kube-node configured, node conditions will not be published");
        }
        if self.lock_target().is_none() {
            tracing::warn!("No lock daemonset configured, upgrading without fleet-wide locking");
        }
        if self.reboot && !self.drain {
            tracing::warn!("Reboots are enabled without draining the node");
        }
    }
}
