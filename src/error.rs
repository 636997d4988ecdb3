//! Error types for host-upgrades.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while coordinating host upgrades across the fleet.
#[derive(Error, Debug)]
pub enum HostUpgradesError {
    /// Transport or authorization failure talking to the Kubernetes API.
    #[error("Kubernetes API error [{0}]: {1}")]
    Connection(String, String),

    /// Optimistic concurrency failure: the object changed since it was read.
    #[error("Conflict updating {0}: {1}")]
    Conflict(String, String),

    #[error("Lock {lock} is busy (held by {holder})")]
    LockBusy { lock: String, holder: String },

    #[error("Broken lock {lock}: {key}={value:?}, expected {expected:?}")]
    BrokenLock {
        lock: String,
        key: String,
        value: String,
        expected: String,
    },

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Host upgrade failed: {0}")]
    Upgrade(String),

    #[error("Node {node} is still rebooting (reboot={reboot_time} >= boot={boot_time})")]
    StillRebooting {
        node: String,
        reboot_time: DateTime<Utc>,
        boot_time: DateTime<Utc>,
    },

    #[error("Timeout waiting for host to shutdown after {0:?}")]
    RebootTimeout(Duration),

    #[error("Failed to drain node {0}: {1}")]
    Drain(String, String),

    /// Failure after the node started draining for a reboot. The node may be
    /// left cordoned until startup recovery runs.
    #[error("Reboot sequence failed: {0}")]
    Reboot(String),

    #[error("Invalid annotation {0}: {1}")]
    InvalidAnnotation(String, String),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = HostUpgradesError> = std::result::Result<T, E>;

impl HostUpgradesError {
    /// Map a kube client error, keeping HTTP 409 apart so it can be retried.
    pub fn from_kube(context: impl Into<String>, err: kube::Error) -> Self {
        let context = context.into();

        match err {
            kube::Error::Api(ref response) if response.code == 409 => {
                Self::Conflict(context, err.to_string())
            }
            _ => Self::Connection(context, err.to_string()),
        }
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_, _))
    }

    /// Errors that must terminate the process instead of failing one cycle.
    ///
    /// A restart runs startup recovery, which uncordons the node and frees a
    /// lock left behind by a half-finished reboot.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_, _)
                | Self::StillRebooting { .. }
                | Self::RebootTimeout(_)
                | Self::Drain(_, _)
                | Self::Reboot(_)
                | Self::Host(_)
                | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_lock_busy() {
        let err = HostUpgradesError::LockBusy {
            lock: "kube-system/daemonsets/host-upgrades".to_string(),
            holder: "node-b".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Lock kube-system/daemonsets/host-upgrades is busy (held by node-b)"
        );
    }

    #[test]
    fn test_error_display_broken_lock() {
        let err = HostUpgradesError::BrokenLock {
            lock: "ns/daemonsets/ds".to_string(),
            key: "lock".to_string(),
            value: "node-b".to_string(),
            expected: "node-a".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Broken lock ns/daemonsets/ds: lock=\"node-b\", expected \"node-a\""
        );
    }

    #[test]
    fn test_error_display_reboot_timeout() {
        let err = HostUpgradesError::RebootTimeout(Duration::from_secs(300));
        assert_eq!(
            err.to_string(),
            "Timeout waiting for host to shutdown after 300s"
        );
    }

    #[test]
    fn test_is_conflict() {
        assert!(HostUpgradesError::Conflict("node/a".into(), "409".into()).is_conflict());
        assert!(!HostUpgradesError::Connection("node/a".into(), "eof".into()).is_conflict());
        assert!(!HostUpgradesError::Upgrade("apt failed".into()).is_conflict());
    }

    #[test]
    fn test_is_fatal() {
        assert!(HostUpgradesError::RebootTimeout(Duration::from_secs(1)).is_fatal());
        assert!(HostUpgradesError::Connection("x".into(), "y".into()).is_fatal());
        assert!(HostUpgradesError::Drain("node-a".into(), "evict".into()).is_fatal());
        assert!(HostUpgradesError::Reboot("conflict".into()).is_fatal());
        assert!(!HostUpgradesError::Upgrade("apt failed".into()).is_fatal());
        assert!(!HostUpgradesError::Conflict("x".into(), "y".into()).is_fatal());
        assert!(!HostUpgradesError::DeadlineExceeded("window".into()).is_fatal());
    }
}
