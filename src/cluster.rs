//! Cluster API operations consumed by the lock and the node state.
//!
//! Every mutation takes the resource version of the record it was computed
//! from, and fails with [`HostUpgradesError::Conflict`] when the object has
//! changed since.
//!
//! [`HostUpgradesError::Conflict`]: crate::error::HostUpgradesError::Conflict

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{Condition, NodeRecord, NodeUpdate, ObjectEvent, ObjectRecord};

/// The fleet-wide object whose annotations carry the upgrade lock.
#[async_trait]
pub trait CoordinationObject: Send + Sync {
    /// Human readable identity, e.g. `kube-system/daemonsets/host-upgrades`.
    fn describe(&self) -> String;

    async fn get(&self) -> Result<ObjectRecord>;

    /// Set (`Some`) or remove (`None`) one annotation, compare-and-set
    /// against `resource_version`.
    async fn update_annotation(
        &self,
        resource_version: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<ObjectRecord>;

    /// Watch the object for changes after `resource_version`.
    ///
    /// The stream may end at any time (server-side watch timeout); callers
    /// re-read the object and watch again.
    async fn watch(&self, resource_version: &str) -> Result<BoxStream<'static, ObjectEvent>>;
}

/// The node object representing this machine.
#[async_trait]
pub trait NodeObject: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self) -> Result<NodeRecord>;

    /// Apply annotation and schedulability changes.
    async fn update(&self, resource_version: &str, update: &NodeUpdate) -> Result<NodeRecord>;

    /// Replace the full status condition list.
    async fn update_conditions(
        &self,
        resource_version: &str,
        conditions: &[Condition],
    ) -> Result<NodeRecord>;
}

/// Cordon a node and evict its workloads.
#[async_trait]
pub trait Drainer: Send + Sync {
    async fn drain(&self, node: &str) -> Result<()>;
}
