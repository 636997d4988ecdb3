//! The node object of this machine.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::cluster::NodeObject;
use crate::error::{HostUpgradesError, Result};
use crate::types::{Condition, NodeRecord, NodeUpdate};

pub struct KubeNode {
    api: Api<Node>,
    name: String,
}

impl KubeNode {
    pub fn new(client: Client, name: &str) -> Self {
        Self {
            api: Api::all(client),
            name: name.to_string(),
        }
    }

    fn describe(&self) -> String {
        format!("nodes/{}", self.name)
    }

    fn record(&self, node: Node) -> Result<NodeRecord> {
        node_record(node).map_err(|e| {
            HostUpgradesError::Connection(self.describe(), format!("invalid node conditions: {}", e))
        })
    }
}

fn node_record(node: Node) -> serde_json::Result<NodeRecord> {
    let conditions = node
        .status
        .and_then(|status| status.conditions)
        .unwrap_or_default();

    // NodeCondition and Condition share the wire format.
    let conditions = serde_json::from_value(serde_json::to_value(conditions)?)?;

    Ok(NodeRecord {
        name: node.metadata.name.unwrap_or_default(),
        annotations: node.metadata.annotations.unwrap_or_default(),
        conditions,
        unschedulable: node.spec.and_then(|spec| spec.unschedulable).unwrap_or(false),
        resource_version: node.metadata.resource_version,
    })
}

/// Merge patch for annotation and schedulability changes.
fn update_patch(resource_version: &str, update: &NodeUpdate) -> Value {
    let mut metadata = Map::new();
    metadata.insert("resourceVersion".to_string(), json!(resource_version));
    if !update.annotations.is_empty() {
        metadata.insert("annotations".to_string(), json!(update.annotations));
    }

    let mut patch = Map::new();
    patch.insert("metadata".to_string(), Value::Object(metadata));
    if let Some(unschedulable) = update.unschedulable {
        patch.insert("spec".to_string(), json!({ "unschedulable": unschedulable }));
    }
    Value::Object(patch)
}

/// Merge patch replacing the whole condition list.
fn conditions_patch(resource_version: &str, conditions: &[Condition]) -> Value {
    json!({
        "metadata": { "resourceVersion": resource_version },
        "status": { "conditions": conditions },
    })
}

#[async_trait]
impl NodeObject for KubeNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<NodeRecord> {
        let node = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| HostUpgradesError::from_kube(self.describe(), e))?;
        self.record(node)
    }

    async fn update(&self, resource_version: &str, update: &NodeUpdate) -> Result<NodeRecord> {
        let patch = update_patch(resource_version, update);
        debug!(node = %self.describe(), patch = %patch, "Patching node");

        let node = self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| HostUpgradesError::from_kube(self.describe(), e))?;
        self.record(node)
    }

    async fn update_conditions(
        &self,
        resource_version: &str,
        conditions: &[Condition],
    ) -> Result<NodeRecord> {
        let patch = conditions_patch(resource_version, conditions);

        let node = self
            .api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| HostUpgradesError::from_kube(format!("{}/status", self.describe()), e))?;
        self.record(node)
    }
}
