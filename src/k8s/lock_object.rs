//! Lock annotations on a namespaced Kubernetes object.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::{Api, Patch, PatchParams, WatchEvent, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::cluster::CoordinationObject;
use crate::error::{HostUpgradesError, Result};
use crate::types::{ObjectEvent, ObjectRecord};

/// Any namespaced resource works as the coordination object; the daemonset
/// running the upgrades is the usual choice.
pub struct KubeLockObject<K = DaemonSet> {
    api: Api<K>,
    namespace: String,
    name: String,
}

impl<K> KubeLockObject<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

fn object_record<K: Resource>(object: &K) -> ObjectRecord {
    let meta = object.meta();
    ObjectRecord {
        name: meta.name.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone(),
    }
}

/// Merge patch setting or removing one annotation, rejected by the server
/// with 409 if the object moved past `resource_version`.
fn annotation_patch(resource_version: &str, key: &str, value: Option<&str>) -> Value {
    let mut annotations = serde_json::Map::new();
    annotations.insert(key.to_string(), json!(value));

    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "annotations": annotations,
        }
    })
}

fn object_event<K: Resource>(event: kube::Result<WatchEvent<K>>) -> ObjectEvent {
    match event {
        Ok(WatchEvent::Added(object)) => ObjectEvent::Added(object_record(&object)),
        Ok(WatchEvent::Modified(object)) => ObjectEvent::Modified(object_record(&object)),
        Ok(WatchEvent::Deleted(object)) => ObjectEvent::Deleted(object_record(&object)),
        Ok(WatchEvent::Bookmark(_)) => ObjectEvent::Bookmark,
        Ok(WatchEvent::Error(status)) => ObjectEvent::Error(status.message.clone()),
        Err(e) => ObjectEvent::Error(e.to_string()),
    }
}

#[async_trait]
impl<K> CoordinationObject for KubeLockObject<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    fn describe(&self) -> String {
        format!("{}/{}/{}", self.namespace, K::plural(&()), self.name)
    }

    async fn get(&self) -> Result<ObjectRecord> {
        let object = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| HostUpgradesError::from_kube(self.describe(), e))?;
        Ok(object_record(&object))
    }

    async fn update_annotation(
        &self,
        resource_version: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<ObjectRecord> {
        let patch = annotation_patch(resource_version, key, value);
        debug!(object = %self.describe(), patch = %patch, "Patching annotation");

        let object = self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| HostUpgradesError::from_kube(self.describe(), e))?;
        Ok(object_record(&object))
    }

    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, ObjectEvent>> {
        let params = WatchParams::default().fields(&format!("metadata.name={}", self.name));

        let events = self
            .api
            .watch(&params, resource_version)
            .await
            .map_err(|e| HostUpgradesError::from_kube(self.describe(), e))?;
        Ok(events.map(object_event).boxed())
    }
}
