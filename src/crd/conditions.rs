//! Condition and state types shared by RGD and instance statuses

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a condition (True, False, Unknown)
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The condition could not be evaluated
    #[default]
    Unknown,
}

/// A standard status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. Ready, GraphResolved)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
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

    /// Whether the condition currently holds
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Coarse outcome on an instance status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstanceState {
    /// Resources are being created or are not yet ready
    #[default]
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    /// Every non-skipped resource is ready
    #[serde(rename = "ACTIVE")]
    Active,
    /// A resource failed to resolve or apply
    #[serde(rename = "FAILED")]
    Failed,
    /// The instance is being deleted
    #[serde(rename = "DELETING")]
    Deleting,
}

/// Per-resource state within one reconcile pass
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ResourceState {
    /// Not yet processed, or blocked on an upstream
    #[default]
    Pending,
    /// Expressions resolved into desired objects
    Resolved,
    /// Desired objects applied, readiness not yet confirmed
    Applied,
    /// All readiness checks passed
    Ready,
    /// Resolution or apply failed
    Failed,
    /// Excluded by includeWhen
    Skipped,
}

/// Per-resource entry on the instance status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Graph resource id
    pub id: String,

    /// Current state
    pub state: ResourceState,

    /// Failure or wait detail, when relevant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
