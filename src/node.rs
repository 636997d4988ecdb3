//! Read-modify-write helpers for this machine's node object.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::NodeObject;
use crate::error::Result;
use crate::retry::{Backoff, retry_on_conflict};
use crate::types::{self, Condition, ConditionType, NodeRecord, NodeUpdate, merge_condition};

/// Node annotations and conditions, every update retried on conflict.
#[derive(Clone)]
pub struct NodeState {
    node: Arc<dyn NodeObject>,
    backoff: Backoff,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nodes/{}", self.node.name())
    }
}

impl NodeState {
    pub fn new(node: Arc<dyn NodeObject>) -> Self {
        Self {
            node,
            backoff: Backoff::DEFAULT,
        }
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub async fn get_condition(&self, type_: ConditionType) -> Result<Option<Condition>> {
        let record = self.node.get().await?;
        Ok(record.condition(type_).cloned())
    }

    pub async fn has_condition(&self, type_: ConditionType) -> Result<bool> {
        Ok(self.get_condition(type_).await?.is_some())
    }

    /// Merge the given conditions into the node status.
    pub async fn try_set_conditions(&self, conditions: &[Condition]) -> Result<()> {
        let node = &self.node;

        retry_on_conflict(&self.backoff, || async move {
            let record = node.get().await?;
            let now = types::now();

            let mut merged = record.conditions.clone();
            for condition in conditions {
                merge_condition(&mut merged, condition.clone(), now);
            }

            node.update_conditions(record.version(), &merged).await?;
            Ok(())
        })
        .await?;

        for condition in conditions {
            debug!(
                node = %self,
                condition = %condition.type_,
                status = %condition.status,
                reason = condition.reason.as_deref().unwrap_or_default(),
                "Updated node condition"
            );
        }

        Ok(())
    }

    /// Best-effort [`Self::try_set_conditions`]: failures are logged and
    /// reported as `false`.
    pub async fn set_conditions(&self, conditions: &[Condition]) -> bool {
        match self.try_set_conditions(conditions).await {
            Ok(()) => true,
            Err(e) => {
                warn!(node = %self, error = %e, "Failed to update node conditions");
                false
            }
        }
    }

    /// Publish an `Unknown` condition with no reason.
    pub async fn init_condition(&self, type_: ConditionType) -> Result<()> {
        self.try_set_conditions(&[crate::conditions::initial_condition(type_, types::now())])
            .await
    }

    pub async fn get_annotation(&self, key: &str) -> Result<Option<String>> {
        let record = self.node.get().await?;
        Ok(record.annotations.get(key).cloned())
    }

    pub async fn set_annotation(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|record| {
            (record.annotations.get(key).map(String::as_str) != Some(value))
                .then(|| NodeUpdate::default().set_annotation(key, value))
        })
        .await?;
        debug!(node = %self, key = key, value = value, "Set node annotation");
        Ok(())
    }

    /// Remove an annotation. Missing annotations are left alone.
    pub async fn clear_annotation(&self, key: &str) -> Result<()> {
        let changed = self
            .modify(|record| {
                record
                    .annotations
                    .contains_key(key)
                    .then(|| NodeUpdate::default().clear_annotation(key))
            })
            .await?;
        if changed {
            debug!(node = %self, key = key, "Cleared node annotation");
        }
        Ok(())
    }

    /// Undo a drain: if `key` is present, clear it and mark the node
    /// schedulable in the same update. Returns whether anything changed.
    pub async fn set_schedulable_if_annotated(&self, key: &str) -> Result<bool> {
        self.modify(|record| {
            record
                .annotations
                .contains_key(key)
                .then(|| NodeUpdate::default().clear_annotation(key).schedulable())
        })
        .await
    }

    /// Fetch, compute an update, write it. `None` from `change` skips the
    /// write.
    async fn modify<F>(&self, change: F) -> Result<bool>
    where
        F: Fn(&NodeRecord) -> Option<NodeUpdate> + Send + Sync,
    {
        let node = &self.node;
        let change = &change;

        retry_on_conflict(&self.backoff, || async move {
            let record = node.get().await?;

            match change(&record) {
                Some(update) => {
                    node.update(record.version(), &update).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
    }
}
