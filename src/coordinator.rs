//! Upgrade cycle policy: lock, upgrade, publish, drain and reboot, plus the
//! startup recovery that undoes a finished reboot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cluster::Drainer;
use crate::conditions::{reboot_condition, rebooted_condition, rebooting_condition, upgrade_condition};
use crate::error::{HostUpgradesError, Result};
use crate::host::{Host, UpgradeStatus};
use crate::lock::{DistributedLock, Hold, with_lock};
use crate::node::NodeState;
use crate::scheduler::CycleContext;
use crate::types::{self, ConditionType, DRAIN_ANNOTATION, REBOOT_ANNOTATION};

/// Reboot and drain policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub reboot: bool,
    pub drain: bool,
    /// How long to wait for the service manager to stop us after a reboot
    /// was requested.
    pub reboot_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reboot: false,
            drain: false,
            reboot_timeout: Duration::from_secs(300),
        }
    }
}

/// What startup found out about a previously requested reboot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RebootRecovery {
    #[default]
    NotRebooting,
    Rebooted {
        requested: DateTime<Utc>,
        booted: DateTime<Utc>,
    },
}

/// Startup recovery report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub reboot: RebootRecovery,
    /// A drain left behind by a previous run was undone.
    pub uncordoned: bool,
    /// Our own lock left behind by a previous run was released.
    pub released_lock: bool,
}

pub struct Coordinator {
    host: Arc<dyn Host>,
    node: Option<NodeState>,
    lock: Option<DistributedLock>,
    drainer: Option<Arc<dyn Drainer>>,
    options: Options,
}

impl Coordinator {
    pub fn new(host: Arc<dyn Host>, options: Options) -> Self {
        Self {
            host,
            node: None,
            lock: None,
            drainer: None,
            options,
        }
    }

    pub fn with_node(mut self, node: NodeState) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_drainer(mut self, drainer: Arc<dyn Drainer>) -> Self {
        self.drainer = Some(drainer);
        self
    }

    /// Reconcile cluster state with the host after a (re)start.
    ///
    /// Fails with [`HostUpgradesError::StillRebooting`] if a reboot was
    /// requested but the host has not booted since, leaving everything as
    /// it was.
    pub async fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();

        if let Some(node) = &self.node {
            self.init_conditions(node).await;
            recovery.reboot = self.clear_reboot(node).await?;

            recovery.uncordoned = node.set_schedulable_if_annotated(DRAIN_ANNOTATION).await?;
            if recovery.uncordoned {
                info!(node = %node, annotation = DRAIN_ANNOTATION, "Uncordoned drained node");
            } else {
                debug!(node = %node, annotation = DRAIN_ANNOTATION, "Node is not marked as drained");
            }
        } else {
            info!("No node configured, skipping node recovery");
        }

        if let Some(lock) = &self.lock {
            let (value, acquired) = lock.test().await?;

            if acquired {
                lock.release().await?;
                recovery.released_lock = true;
                info!(lock = %lock, value = %value, "Released lock left by previous run");
            } else {
                info!(lock = %lock, value = %value, "Using lock (not acquired)");
            }
        }

        Ok(recovery)
    }

    async fn init_conditions(&self, node: &NodeState) {
        for type_ in ConditionType::ALL {
            let result = match node.has_condition(type_).await {
                Ok(true) => continue,
                Ok(false) => node.init_condition(type_).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => info!(node = %node, condition = %type_, "Initialized node condition"),
                Err(e) => warn!(node = %node, condition = %type_, error = %e, "Failed to initialize node condition"),
            }
        }
    }

    async fn clear_reboot(&self, node: &NodeState) -> Result<RebootRecovery> {
        let Some(value) = node.get_annotation(REBOOT_ANNOTATION).await? else {
            info!(node = %node, "Node is not rebooting");
            return Ok(RebootRecovery::NotRebooting);
        };

        let requested: DateTime<Utc> = serde_json::from_str(&value).map_err(|e| {
            HostUpgradesError::InvalidAnnotation(REBOOT_ANNOTATION.to_string(), format!("{:?}: {}", value, e))
        })?;
        let booted = self.host.info().boot_time;

        if booted <= requested {
            return Err(HostUpgradesError::StillRebooting {
                node: node.name().to_string(),
                reboot_time: requested,
                boot_time: booted,
            });
        }

        node.set_conditions(&[rebooted_condition(booted, types::now())])
            .await;
        node.clear_annotation(REBOOT_ANNOTATION).await?;

        info!(
            node = %node,
            reboot_time = %requested,
            boot_time = %booted,
            "Node was rebooted"
        );
        Ok(RebootRecovery::Rebooted { requested, booted })
    }

    /// One upgrade cycle.
    ///
    /// When a reboot was triggered this waits out the reboot timeout and
    /// returns [`HostUpgradesError::RebootTimeout`]; normally the process is
    /// killed by the host shutdown first.
    pub async fn run_cycle(&self, ctx: &CycleContext) -> Result<()> {
        let hold = with_lock(self.lock.as_ref(), ctx.deadline(), || self.upgrade(ctx)).await?;

        match hold {
            Hold::Release => {
                info!("Upgrade cycle done");
                Ok(())
            }
            Hold::Keep => {
                info!(
                    timeout_seconds = self.options.reboot_timeout.as_secs(),
                    "Waiting for host shutdown"
                );
                tokio::time::sleep(self.options.reboot_timeout).await;
                Err(HostUpgradesError::RebootTimeout(self.options.reboot_timeout))
            }
        }
    }

    /// Runs with the lock held.
    async fn upgrade(&self, ctx: &CycleContext) -> Result<Hold> {
        ctx.check_deadline()?;

        info!(host = %self.host.info(), "Running host upgrades");
        let result = self.host.upgrade().await;
        self.publish_status(&result).await;

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Host upgrade failed");
                return Err(e);
            }
        };

        if !status.reboot_required {
            info!("No reboot required");
            return Ok(Hold::Release);
        }
        if !self.options.reboot {
            info!("Reboot required, but skipping without --reboot");
            return Ok(Hold::Release);
        }

        // Any failure from here on may leave the node cordoned, which only
        // startup recovery undoes.
        self.reboot().await.map_err(|e| match e {
            e if e.is_fatal() => e,
            e => HostUpgradesError::Reboot(e.to_string()),
        })?;

        info!("Host is shutting down");
        Ok(Hold::Keep)
    }

    async fn reboot(&self) -> Result<()> {
        if self.options.drain {
            self.drain().await?;
        } else {
            info!("Reboot required, rebooting without draining node");
        }

        self.mark_reboot(types::now()).await?;
        self.host.reboot().await
    }

    async fn publish_status(&self, result: &Result<UpgradeStatus>) {
        let Some(node) = &self.node else {
            debug!("No node configured, skipping condition update");
            return;
        };

        let now = types::now();
        let outcome = result.as_ref();
        node.set_conditions(&[
            upgrade_condition(outcome, now),
            reboot_condition(self.host.info(), outcome, now),
        ])
        .await;
    }

    async fn drain(&self) -> Result<()> {
        let (Some(node), Some(drainer)) = (&self.node, &self.drainer) else {
            return Err(HostUpgradesError::Config(
                "--drain requires a configured node".to_string(),
            ));
        };

        info!(node = %node, annotation = DRAIN_ANNOTATION, "Reboot required, draining node");
        node.set_annotation(DRAIN_ANNOTATION, "true").await?;
        drainer.drain(node.name()).await
    }

    /// Record the reboot request so the next startup can verify it happened.
    async fn mark_reboot(&self, reboot_time: DateTime<Utc>) -> Result<()> {
        let Some(node) = &self.node else {
            debug!("No node configured, skipping reboot marking");
            return Ok(());
        };

        let value = serde_json::to_string(&reboot_time).map_err(|e| {
            HostUpgradesError::InvalidAnnotation(REBOOT_ANNOTATION.to_string(), e.to_string())
        })?;

        info!(node = %node, annotation = REBOOT_ANNOTATION, value = %value, "Marking node for reboot");
        node.set_annotation(REBOOT_ANNOTATION, &value).await?;
        node.try_set_conditions(&[rebooting_condition(reboot_time, types::now())])
            .await
    }
}
