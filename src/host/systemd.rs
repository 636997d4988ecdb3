//! Run commands on the host through the host's service manager.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{HostUpgradesError, Result};

/// Transient unit the upgrade script runs as; a second concurrent run fails
/// to start instead of racing the first.
pub const UNIT: &str = "host-upgrades";

/// Arguments for `systemd-run`, running `cmd` as a transient oneshot unit and
/// piping its output back.
pub fn systemd_run_args(unit: &str, env: &[(&str, String)], cmd: &[String]) -> Vec<String> {
    let mut args = vec![
        "--wait".to_string(),
        "--pipe".to_string(),
        "--collect".to_string(),
        "--quiet".to_string(),
        "--service-type=oneshot".to_string(),
        format!("--unit={}", unit),
    ];

    args.extend(env.iter().map(|(key, value)| format!("--setenv={}={}", key, value)));
    args.push("--".to_string());
    args.extend(cmd.iter().cloned());
    args
}

/// Run `cmd` on the host and wait for it, returning the combined output.
///
/// A non-zero exit is an upgrade failure carrying the unit's output.
pub async fn exec(unit: &str, env: &[(&str, String)], cmd: &[String]) -> Result<String> {
    let args = systemd_run_args(unit, env, cmd);
    info!(unit = unit, cmd = ?cmd, "Starting transient unit");

    // Clear a failed unit left over from a previous run; fails harmlessly
    // when the unit is not loaded.
    if let Err(e) = Command::new("systemctl")
        .arg("reset-failed")
        .arg(format!("{}.service", unit))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        debug!(unit = unit, error = %e, "Failed to reset unit");
    }

    let output = Command::new("systemd-run")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| HostUpgradesError::Upgrade(format!("Failed to run systemd-run: {}", e)))?;

    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));

    for line in log.lines() {
        debug!(unit = unit, "{}", line);
    }

    if output.status.success() {
        info!(unit = unit, "Transient unit finished");
        Ok(log)
    } else {
        warn!(unit = unit, status = %output.status, "Transient unit failed");
        Err(HostUpgradesError::Upgrade(format!(
            "{} {:?}: {}\n{}",
            unit,
            cmd,
            output.status,
            log.trim_end()
        )))
    }
}

/// Ask the host to reboot. Returns once the request is queued; the service
/// manager stops this process during shutdown.
pub async fn reboot() -> Result<()> {
    info!("Requesting host reboot");

    let status = Command::new("systemctl")
        .arg("reboot")
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| HostUpgradesError::Host(format!("Failed to run systemctl reboot: {}", e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(HostUpgradesError::Host(format!(
            "systemctl reboot failed: {}",
            status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemd_run_args() {
        let args = systemd_run_args(
            UNIT,
            &[("HOST_PATH", "/run/host-upgrades".to_string())],
            &[
                "/bin/sh".to_string(),
                "-x".to_string(),
                "/run/host-upgrades/host-upgrades.sh".to_string(),
            ],
        );

        assert_eq!(
            args,
            vec![
                "--wait",
                "--pipe",
                "--collect",
                "--quiet",
                "--service-type=oneshot",
                "--unit=host-upgrades",
                "--setenv=HOST_PATH=/run/host-upgrades",
                "--",
                "/bin/sh",
                "-x",
                "/run/host-upgrades/host-upgrades.sh",
            ]
        );
    }

    #[test]
    fn test_systemd_run_args_empty_env_value() {
        let args = systemd_run_args(UNIT, &[("CONFIG_PATH", String::new())], &["true".to_string()]);
        assert!(args.contains(&"--setenv=CONFIG_PATH=".to_string()));
    }
}
