//! Status condition helpers
//!
//! Conditions are upserted by type. The transition timestamp only moves when
//! the status value actually changes, so consumers can tell how long a
//! condition has held.

use crate::crd::{ConditionStatus, CsiCondition, CsiDeploymentStatus};
use chrono::Utc;

/// The spec passed structural validation.
pub const CONDITION_VALIDATED: &str = "Validated";
/// The last reconciliation completed without error.
pub const CONDITION_SYNCED: &str = "Synced";
/// The node driver DaemonSet has no unavailable replicas.
pub const CONDITION_NODE_AVAILABLE: &str = "NodeAvailable";
/// The controller driver Deployment has no unavailable replicas.
pub const CONDITION_CONTROLLER_AVAILABLE: &str = "ControllerAvailable";

/// Upsert a condition, preserving `lastTransitionTime` unless the status
/// value changed.
pub fn update_condition(
    status: &mut CsiDeploymentStatus,
    r#type: &str,
    value: ConditionStatus,
    message: &str,
) {
    let message = if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    };

    if let Some(existing) = status.conditions.iter_mut().find(|c| c.r#type == r#type) {
        existing.message = message;
        if existing.status != value {
            existing.status = value;
            existing.last_transition_time = Some(Utc::now());
        }
    } else {
        status.conditions.push(CsiCondition {
            r#type: r#type.to_string(),
            status: value,
            last_transition_time: Some(Utc::now()),
            reason: None,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_new_condition() {
        let mut status = CsiDeploymentStatus::default();
        update_condition(&mut status, CONDITION_SYNCED, ConditionStatus::True, "");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
        assert!(status.conditions[0].message.is_none());
        assert!(status.conditions[0].last_transition_time.is_some());
    }

    #[test]
    fn test_preserves_transition_time_on_same_status() {
        let mut status = CsiDeploymentStatus::default();
        update_condition(&mut status, CONDITION_SYNCED, ConditionStatus::True, "first");
        let stamp = status.conditions[0].last_transition_time;

        update_condition(&mut status, CONDITION_SYNCED, ConditionStatus::True, "second");
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, stamp);
        assert_eq!(status.conditions[0].message.as_deref(), Some("second"));
    }

    #[test]
    fn test_moves_transition_time_on_status_change() {
        let mut status = CsiDeploymentStatus::default();
        update_condition(&mut status, CONDITION_SYNCED, ConditionStatus::True, "");
        let stamp = status.conditions[0].last_transition_time;

        update_condition(
            &mut status,
            CONDITION_SYNCED,
            ConditionStatus::False,
            "sync failed",
        );
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
        assert!(status.conditions[0].last_transition_time >= stamp);

        // Different types live side by side.
        update_condition(
            &mut status,
            CONDITION_NODE_AVAILABLE,
            ConditionStatus::Unknown,
            "",
        );
        assert_eq!(status.conditions.len(), 2);
    }
}
