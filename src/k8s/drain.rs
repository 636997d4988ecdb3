//! Cordon and evict, in the manner of `kubectl drain`.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::Drainer;
use crate::error::{HostUpgradesError, Result};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

pub struct KubeDrainer {
    client: Client,
    timeout: Duration,
    poll_interval: Duration,
}

impl KubeDrainer {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            poll_interval: Duration::from_secs(2),
        }
    }

    async fn cordon(&self, node: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": true } });

        nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| drain_error(node, format!("cordon failed: {}", e)))?;

        info!(node = node, "Cordoned node");
        Ok(())
    }

    async fn evict(&self, node: &str, pod: &Pod, deadline: Instant) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        loop {
            match pods.evict(&name, &EvictParams::default()).await {
                Ok(_) => {
                    info!(node = node, pod = %format!("{}/{}", namespace, name), "Evicted pod");
                    return Ok(());
                }
                Err(kube::Error::Api(response)) if response.code == 404 => {
                    debug!(pod = %format!("{}/{}", namespace, name), "Pod already gone");
                    return Ok(());
                }
                Err(kube::Error::Api(response)) if response.code == 429 => {
                    if Instant::now() + self.poll_interval > deadline {
                        return Err(drain_error(
                            node,
                            format!(
                                "timed out evicting pod {}/{}: {}",
                                namespace, name, response.message
                            ),
                        ));
                    }
                    debug!(
                        pod = %format!("{}/{}", namespace, name),
                        reason = %response.message,
                        "Eviction blocked by disruption budget, retrying"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    return Err(drain_error(
                        node,
                        format!("evicting pod {}/{}: {}", namespace, name, e),
                    ));
                }
            }
        }
    }

    async fn wait_deleted(&self, node: &str, pod: &Pod, deadline: Instant) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        loop {
            let current = pods
                .get_opt(&name)
                .await
                .map_err(|e| drain_error(node, format!("checking pod {}/{}: {}", namespace, name, e)))?;

            // A pod recreated under the same name has a new uid.
            match current {
                Some(current) if current.uid() == pod.uid() => {}
                _ => return Ok(()),
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(drain_error(
                    node,
                    format!("timed out waiting for pod {}/{} to terminate", namespace, name),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn drain_error(node: &str, message: String) -> HostUpgradesError {
    HostUpgradesError::Drain(node.to_string(), message)
}

fn pod_selector(node: &str) -> ListParams {
    ListParams::default().fields(&format!("spec.nodeName={}", node))
}

/// Mirror pods belong to the kubelet and daemonset pods would be recreated
/// right away; neither is evicted.
fn is_evictable(pod: &Pod) -> bool {
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return false;
    }

    !pod.owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet" && owner.controller == Some(true))
}

#[async_trait]
impl Drainer for KubeDrainer {
    async fn drain(&self, node: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        self.cordon(node).await?;

        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&pod_selector(node))
            .await
            .map_err(|e| drain_error(node, format!("listing pods: {}", e)))?;

        let total = list.items.len();
        let evictable: Vec<Pod> = list.items.into_iter().filter(is_evictable).collect();

        info!(
            node = node,
            pods = total,
            evicting = evictable.len(),
            timeout_seconds = self.timeout.as_secs(),
            "Draining node"
        );

        for pod in &evictable {
            self.evict(node, pod, deadline).await?;
        }

        for pod in &evictable {
            if let Err(e) = self.wait_deleted(node, pod, deadline).await {
                warn!(node = node, error = %e, "Drain did not complete");
                return Err(e);
            }
        }

        info!(node = node, evicted = evictable.len(), "Drained node");
        Ok(())
    }
}
