//! Startup sequence and the scheduled upgrade loop.

use std::path::Path;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::DaemonSet;
use tracing::info;

use crate::config::Config;
use crate::coordinator::{Coordinator, Options};
use crate::error::Result;
use crate::health::HealthState;
use crate::host::{self, Host, HostConfig};
use crate::k8s::{KubeDrainer, KubeLockObject, KubeNode, build_client};
use crate::lock::DistributedLock;
use crate::node::NodeState;
use crate::scheduler::Scheduler;
use crate::types::LOCK_ANNOTATION;

const PROC_ROOT: &str = "/proc";

/// Validate, probe and configure the host, recover from the previous run,
/// then upgrade on schedule. Only returns on error, or after a single run
/// when no schedule is configured.
pub async fn run(config: Config, health: HealthState) -> Result<()> {
    config.validate()?;
    config.display();

    let host_config = HostConfig::load(&config.config_path, &config.host_mount)?;
    let mut host = host::probe(&config.os_release_path, Path::new(PROC_ROOT))?;
    host.configure(&host_config).await?;

    let scheduler = Scheduler::new(config.schedule.as_deref(), config.schedule_window())?;
    let coordinator = build_coordinator(&config, Arc::new(host)).await?;

    let recovery = coordinator.recover().await?;
    info!(
        reboot = ?recovery.reboot,
        uncordoned = recovery.uncordoned,
        released_lock = recovery.released_lock,
        "Startup recovery complete"
    );
    health.set_ready(true);

    let coordinator = &coordinator;
    scheduler
        .run(|ctx| async move { coordinator.run_cycle(&ctx).await })
        .await
}

async fn build_coordinator(config: &Config, host: Arc<dyn Host>) -> Result<Coordinator> {
    let options = Options {
        reboot: config.reboot,
        drain: config.drain,
        reboot_timeout: config.reboot_timeout(),
    };
    let coordinator = Coordinator::new(host, options);

    let Some(node_name) = config.kube_node.as_deref() else {
        info!("No node configured, running without Kubernetes");
        return Ok(coordinator);
    };

    let client = build_client().await?;
    let mut coordinator =
        coordinator.with_node(NodeState::new(Arc::new(KubeNode::new(client.clone(), node_name))));

    if let Some((namespace, daemonset)) = config.lock_target() {
        let object = KubeLockObject::<DaemonSet>::new(client.clone(), namespace, daemonset);
        coordinator =
            coordinator.with_lock(DistributedLock::new(Arc::new(object), LOCK_ANNOTATION, node_name));
    }

    if config.drain {
        coordinator =
            coordinator.with_drainer(Arc::new(KubeDrainer::new(client, config.drain_timeout())));
    }

    Ok(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostUpgradesError;
    use clap::Parser;

    #[tokio::test]
    async fn test_invalid_config_fails_before_startup() {
        let config = Config::try_parse_from(["host-upgrades", "--drain", "--kube-node", "node-a"]).unwrap();
        let health = HealthState::new();

        let err = run(config, health.clone()).await.unwrap_err();

        assert!(matches!(err, HostUpgradesError::Config(_)));
        assert!(err.is_fatal());
        assert!(!health.is_ready());
    }

    #[tokio::test]
    async fn test_missing_host_mount_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("missing");
        let config = Config::try_parse_from([
            "host-upgrades",
            "--config-path",
            dir.path().to_str().unwrap(),
            "--host-mount",
            mount.to_str().unwrap(),
        ])
        .unwrap();
        let health = HealthState::new();

        let err = run(config, health.clone()).await.unwrap_err();

        assert!(matches!(err, HostUpgradesError::Host(_)));
        assert!(!health.is_ready());
    }
}
