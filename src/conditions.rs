//! Node conditions published for each upgrade outcome.
//!
//! Every builder is a pure function of its inputs and `now`, which only ends
//! up in the heartbeat time (and the transition time where noted).

use chrono::{DateTime, Utc};

use crate::error::HostUpgradesError;
use crate::host::{HostInfo, UpgradeStatus};
use crate::types::{Condition, ConditionStatus, ConditionType, reason};

/// Outcome of `Host::upgrade`, borrowed for condition building.
pub type UpgradeOutcome<'a> = Result<&'a UpgradeStatus, &'a HostUpgradesError>;

fn with_optional_message(condition: Condition, message: &str) -> Condition {
    if message.is_empty() {
        condition
    } else {
        condition.with_message(message)
    }
}

/// `HostUpgrades`: is the host running with all upgrades applied?
pub fn upgrade_condition(outcome: UpgradeOutcome<'_>, now: DateTime<Utc>) -> Condition {
    match outcome {
        Err(err) => Condition::new(ConditionType::Upgrade, ConditionStatus::Unknown, now)
            .with_reason(reason::UPGRADE_FAILED)
            .with_message(err.to_string()),
        Ok(status) if status.reboot_required => with_optional_message(
            Condition::new(ConditionType::Upgrade, ConditionStatus::False, now)
                .with_reason(reason::REBOOT_REQUIRED),
            &status.upgrade_log,
        ),
        Ok(status) => with_optional_message(
            Condition::new(ConditionType::Upgrade, ConditionStatus::True, now)
                .with_reason(reason::UP_TO_DATE),
            &status.upgrade_log,
        ),
    }
}

/// `HostUpgradesReboot`: does the host need a reboot, and since when?
///
/// A pending reboot outranks an upgrade failure. A failed upgrade carries no
/// status, so a reboot already required before the failure is reported as
/// `Unknown` until the next successful run.
pub fn reboot_condition(info: &HostInfo, outcome: UpgradeOutcome<'_>, now: DateTime<Utc>) -> Condition {
    match outcome {
        Ok(status) if status.reboot_required => with_optional_message(
            Condition::new(ConditionType::Reboot, ConditionStatus::True, now)
                .with_reason(reason::REBOOT_REQUIRED)
                .with_transition(status.reboot_required_since.unwrap_or(now)),
            &status.reboot_required_message,
        ),
        Err(_) => Condition::new(ConditionType::Reboot, ConditionStatus::Unknown, now)
            .with_reason(reason::UPGRADE_FAILED)
            .with_transition(now),
        Ok(status) => with_optional_message(
            Condition::new(ConditionType::Reboot, ConditionStatus::False, now)
                .with_reason(reason::UP_TO_DATE)
                .with_transition(info.boot_time),
            &status.reboot_required_message,
        ),
    }
}

/// Published right before the host is asked to reboot.
pub fn rebooting_condition(reboot_time: DateTime<Utc>, now: DateTime<Utc>) -> Condition {
    Condition::new(ConditionType::Reboot, ConditionStatus::True, now)
        .with_reason(reason::REBOOTING)
        .with_transition(reboot_time)
}

/// Published once startup confirms the requested reboot happened.
pub fn rebooted_condition(boot_time: DateTime<Utc>, now: DateTime<Utc>) -> Condition {
    Condition::new(ConditionType::Reboot, ConditionStatus::False, now)
        .with_reason(reason::REBOOTED)
        .with_transition(boot_time)
}

/// Placeholder for a node that has never been upgraded by us.
pub fn initial_condition(type_: ConditionType, now: DateTime<Utc>) -> Condition {
    Condition::new(type_, ConditionStatus::Unknown, now)
}
