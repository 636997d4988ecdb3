//! Cluster-visible records and the node condition model.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Lock annotation on the fleet coordination object.
pub const LOCK_ANNOTATION: &str = "pharos-host-upgrades.kontena.io/lock";
/// Set on the node before draining, cleared when it is uncordoned again.
pub const DRAIN_ANNOTATION: &str = "pharos-host-upgrades.kontena.io/drain";
/// JSON timestamp of the last requested reboot.
pub const REBOOT_ANNOTATION: &str = "pharos-host-upgrades.kontena.io/reboot";

/// Condition reasons published on the node.
pub mod reason {
    pub const UPGRADE_FAILED: &str = "UpgradeFailed";
    pub const REBOOT_REQUIRED: &str = "RebootRequired";
    pub const UP_TO_DATE: &str = "UpToDate";
    pub const REBOOTING: &str = "Rebooting";
    pub const REBOOTED: &str = "Rebooted";
}

/// Current wall-clock time at the precision Kubernetes stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Condition types owned by this program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionType {
    Upgrade,
    Reboot,
}

impl ConditionType {
    pub const ALL: [Self; 2] = [Self::Upgrade, Self::Reboot];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upgrade => "HostUpgrades",
            Self::Reboot => "HostUpgradesReboot",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A node status condition, serialized with the Kubernetes field names.
///
/// `type_` is a plain string because the node also carries conditions owned
/// by other controllers, which must survive a read-modify-write untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// `None` on a condition about to be published means "now, if the
    /// status changed, otherwise keep the previous transition time".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(type_: ConditionType, status: ConditionStatus, heartbeat: DateTime<Utc>) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status,
            reason: None,
            message: None,
            last_heartbeat_time: Some(heartbeat),
            last_transition_time: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub const fn with_transition(mut self, time: DateTime<Utc>) -> Self {
        self.last_transition_time = Some(time);
        self
    }

    pub fn is(&self, type_: ConditionType) -> bool {
        self.type_ == type_.as_str()
    }
}

/// Replace the condition of the same type, or append it.
///
/// A condition without an explicit transition time inherits the previous one
/// when its status did not change, and gets `now` when it did.
pub fn merge_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    let existing = conditions.iter_mut().find(|c| c.type_ == condition.type_);

    if condition.last_transition_time.is_none() {
        condition.last_transition_time = match &existing {
            Some(previous) if previous.status == condition.status => {
                previous.last_transition_time.or(Some(now))
            }
            _ => Some(now),
        };
    }

    match existing {
        Some(slot) => *slot = condition,
        None => conditions.push(condition),
    }
}

/// Snapshot of an annotatable cluster object used as a lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectRecord {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    /// Opaque version token required for compare-and-set updates.
    pub resource_version: Option<String>,
}

impl ObjectRecord {
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map_or("", String::as_str)
    }

    pub fn version(&self) -> &str {
        self.resource_version.as_deref().unwrap_or_default()
    }
}

/// Events delivered while watching a single object.
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    Added(ObjectRecord),
    Modified(ObjectRecord),
    Deleted(ObjectRecord),
    Bookmark,
    Error(String),
}

/// Snapshot of the node object representing this machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub conditions: Vec<Condition>,
    pub unschedulable: bool,
    pub resource_version: Option<String>,
}

impl NodeRecord {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.is(type_))
    }

    pub fn version(&self) -> &str {
        self.resource_version.as_deref().unwrap_or_default()
    }
}

/// Changes applied to a node in a single compare-and-set update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    /// `None` removes the annotation.
    pub annotations: BTreeMap<String, Option<String>>,
    pub unschedulable: Option<bool>,
}

impl NodeUpdate {
    pub fn set_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations
            .insert(key.to_string(), Some(value.to_string()));
        self
    }

    pub fn clear_annotation(mut self, key: &str) -> Self {
        self.annotations.insert(key.to_string(), None);
        self
    }

    pub const fn schedulable(mut self) -> Self {
        self.unschedulable = Some(false);
        self
    }

    pub const fn unschedulable(mut self) -> Self {
        self.unschedulable = Some(true);
        self
    }

    /// Apply the changes to a local copy, as the API server would.
    pub fn apply(&self, node: &mut NodeRecord) {
        for (key, value) in &self.annotations {
            match value {
                Some(value) => {
                    node.annotations.insert(key.clone(), value.clone());
                }
                None => {
                    node.annotations.remove(key);
                }
            }
        }

        if let Some(unschedulable) = self.unschedulable {
            node.unschedulable = unschedulable;
        }
    }
}
