use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::LabelSet;
use crate::pod::ContainerPort;

// --- Ordinal state ---

/// Lifecycle of one ordinal: `Absent -> Creating -> Ready -> Terminating -> Absent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OrdinalState {
    #[default]
    Absent,
    Creating,
    Ready,
    Terminating,
}

impl std::fmt::Display for OrdinalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrdinalState::Absent => write!(f, "Absent"),
            OrdinalState::Creating => write!(f, "Creating"),
            OrdinalState::Ready => write!(f, "Ready"),
            OrdinalState::Terminating => write!(f, "Terminating"),
        }
    }
}

// --- Claim retention ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RetentionAction {
    #[default]
    Retain,
    Delete,
}

/// What happens to per-ordinal storage claims when pods go away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClaimRetentionPolicy {
    /// Applied to ordinals removed by a scale-down
    #[serde(default, alias = "whenScaled")]
    pub when_scaled: RetentionAction,
    /// Applied to every ordinal when the replica set is deleted
    #[serde(default, alias = "whenDeleted")]
    pub when_deleted: RetentionAction,
}

// --- StatefulSet spec ---

fn default_claim_template() -> String {
    "data".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatefulSetSpec {
    pub replicas: u32,
    /// Labels stamped on every pod of the set
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    /// Name prefix of the per-ordinal storage claim
    #[serde(default = "default_claim_template", alias = "claimTemplate")]
    pub claim_template: String,
    #[serde(default, alias = "persistentVolumeClaimRetentionPolicy")]
    pub claim_retention: ClaimRetentionPolicy,
}

// --- StatefulSet ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatefulSet {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub spec: StatefulSetSpec,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl StatefulSet {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Stable pod name of an ordinal, e.g. `web-0`.
    pub fn pod_name(&self, ordinal: u32) -> String {
        format!("{}-{}", self.name, ordinal)
    }

    /// Stable claim name of an ordinal, e.g. `data-web-0`.
    pub fn claim_name(&self, ordinal: u32) -> String {
        format!("{}-{}-{}", self.spec.claim_template, self.name, ordinal)
    }
}

// --- Transitions and status ---

/// One state change of one ordinal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrdinalTransition {
    pub set: String,
    pub ordinal: u32,
    pub from: OrdinalState,
    pub to: OrdinalState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionType {
    ClaimProvisionFailed,
    PodCreateFailed,
    OrderingViolationDetected,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::ClaimProvisionFailed => write!(f, "ClaimProvisionFailed"),
            ConditionType::PodCreateFailed => write!(f, "PodCreateFailed"),
            ConditionType::OrderingViolationDetected => write!(f, "OrderingViolationDetected"),
        }
    }
}

/// A persistent problem reported on a replica set until it clears.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub condition_type: ConditionType,
    /// Ordinal the problem is tied to, if any
    #[serde(default)]
    pub ordinal: Option<u32>,
    pub message: String,
    /// Consecutive failures of the step that raised this condition
    pub attempts: u32,
    pub since: DateTime<Utc>,
}

/// Snapshot of a replica set's ordinals, published after every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrdinalStatus {
    pub set: String,
    pub namespace: String,
    pub desired_replicas: u32,
    pub ready_replicas: u32,
    pub ordinals: BTreeMap<u32, OrdinalState>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub updated_at: DateTime<Utc>,
}

impl OrdinalStatus {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_set(name: &str) -> StatefulSet {
        serde_yaml::from_str(&format!(
            "name: {}\nspec:\n  replicas: 3\n  claimTemplate: www\n  persistentVolumeClaimRetentionPolicy:\n    whenScaled: Delete\n",
            name
        ))
        .unwrap()
    }

    #[test]
    fn stable_names() {
        let set = make_set("web");
        assert_eq!(set.key(), "default/web");
        assert_eq!(set.pod_name(2), "web-2");
        assert_eq!(set.claim_name(0), "www-web-0");
        assert_eq!(set.spec.claim_retention.when_scaled, RetentionAction::Delete);
        assert_eq!(set.spec.claim_retention.when_deleted, RetentionAction::Retain);
    }
}
