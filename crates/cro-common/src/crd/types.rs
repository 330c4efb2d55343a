//! Types shared by the resource request CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported on every request
pub const CONDITION_READY: &str = "Ready";

/// Reference to the secret that receives connection details
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name, always in the request's namespace
    pub name: String,
}

/// Lifecycle phase of a resource request
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ResourcePhase {
    /// Request accepted, nothing observed yet
    #[default]
    Pending,
    /// External resource is being created or is not yet ready
    InProgress,
    /// External resource is available and the secret is written
    Complete,
    /// Last pass failed; see message
    Failed,
    /// External resource is being torn down
    Deleting,
}

impl std::fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
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

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Observed state shared by `Redis` and `BlobStorage`
///
/// `provider`, `strategy` and `secret_ref` record the last successful
/// provisioning and are only ever set together. Failed passes touch
/// `phase`, `message` and the `Ready` condition only.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudResourceStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ResourcePhase,

    /// Human-readable detail for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Provider that produced the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Tier the resource was provisioned with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Secret holding connection details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,

    /// Conditions (only `Ready` is reported)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the last pass finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl CloudResourceStatus {
    /// Return the `Ready` condition, if any
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == CONDITION_READY)
    }

    /// Replace the `Ready` condition, keeping the transition time when the
    /// status value did not flip
    pub fn set_ready(
        &mut self,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        let mut next = Condition::new(CONDITION_READY, status, reason, message);
        if let Some(prev) = self.ready_condition() {
            if prev.status == next.status {
                next.last_transition_time = prev.last_transition_time;
            }
        }
        self.conditions.retain(|c| c.type_ != CONDITION_READY);
        self.conditions.push(next);
    }

    /// Whether the user-visible fields match another status
    ///
    /// Used to skip writes that would not change what a user sees.
    pub fn same_observation(&self, other: &Self) -> bool {
        self.phase == other.phase
            && self.message == other.message
            && self.provider == other.provider
            && self.strategy == other.strategy
            && self.secret_ref == other.secret_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_status_starts_pending() {
        let status = CloudResourceStatus::default();
        assert_eq!(status.phase, ResourcePhase::Pending);
        assert_eq!(status.phase.to_string(), "Pending");
        assert!(status.ready_condition().is_none());
    }

    #[test]
    fn set_ready_replaces_and_keeps_transition_time() {
        let mut status = CloudResourceStatus::default();
        status.set_ready(ConditionStatus::False, "Provisioning", "creating");
        let first = status.ready_condition().cloned().expect("ready condition");

        status.set_ready(ConditionStatus::False, "Provisioning", "still creating");
        assert_eq!(status.conditions.len(), 1);
        let second = status.ready_condition().expect("ready condition");
        assert_eq!(second.message, "still creating");
        assert_eq!(second.last_transition_time, first.last_transition_time);

        status.set_ready(ConditionStatus::True, "Available", "ready");
        let third = status.ready_condition().expect("ready condition");
        assert_eq!(third.status, ConditionStatus::True);
        assert!(third.last_transition_time >= first.last_transition_time);
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = CloudResourceStatus {
            phase: ResourcePhase::Complete,
            provider: Some("aws-elasticache".to_string()),
            strategy: Some("default".to_string()),
            secret_ref: Some(SecretRef {
                name: "cache-redis".to_string(),
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["phase"], "Complete");
        assert_eq!(json["secretRef"]["name"], "cache-redis");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn same_observation_ignores_conditions_and_timestamps() {
        let mut a = CloudResourceStatus {
            phase: ResourcePhase::InProgress,
            message: Some("creating".to_string()),
            ..Default::default()
        };
        let mut b = a.clone();
        b.last_reconciled = Some(Utc::now());
        b.set_ready(ConditionStatus::False, "Provisioning", "creating");
        assert!(a.same_observation(&b));

        a.message = Some("other".to_string());
        assert!(!a.same_observation(&b));
    }
}
