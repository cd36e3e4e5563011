//! Cluster Conditions
//!
//! The user-visible condition list on the cluster resource. Each condition
//! type appears at most once; setting a condition refreshes its transition
//! timestamp only when the status actually flips.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition types surfaced on the cluster resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Connecting,
    Connected,
    Progressing,
    Ready,
    NotReady,
    Failure,
    Upgrading,
    Ignored,
    Available,
    Expanding,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionType::Connecting => "Connecting",
            ConditionType::Connected => "Connected",
            ConditionType::Progressing => "Progressing",
            ConditionType::Ready => "Ready",
            ConditionType::NotReady => "NotReady",
            ConditionType::Failure => "Failure",
            ConditionType::Upgrading => "Upgrading",
            ConditionType::Ignored => "Ignored",
            ConditionType::Available => "Available",
            ConditionType::Expanding => "Expanding",
        };
        f.write_str(s)
    }
}

/// Condition status, mirroring the core/v1 convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One condition on the cluster resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ClusterCondition {
    pub fn new(r#type: ConditionType, status: ConditionStatus) -> Self {
        Self {
            r#type,
            status,
            last_transition_time: Some(Utc::now()),
            reason: None,
            message: None,
        }
    }

    pub fn with_message(mut self, reason: &str, message: &str) -> Self {
        self.reason = Some(reason.to_string());
        self.message = Some(message.to_string());
        self
    }
}

/// Upsert a condition into the list. The transition timestamp is preserved
/// when the status is unchanged, so watchers see real flips only.
pub fn set_condition(conditions: &mut Vec<ClusterCondition>, mut condition: ClusterCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

/// Record a terminal failure with its human-readable cause, clearing Ready.
pub fn set_failure(conditions: &mut Vec<ClusterCondition>, message: &str) {
    set_condition(
        conditions,
        ClusterCondition::new(ConditionType::Failure, ConditionStatus::True)
            .with_message("ReconcileFailed", message),
    );
    set_condition(
        conditions,
        ClusterCondition::new(ConditionType::Ready, ConditionStatus::False)
            .with_message("ReconcileFailed", message),
    );
}

pub fn find_condition<'a>(
    conditions: &'a [ClusterCondition],
    r#type: ConditionType,
) -> Option<&'a ClusterCondition> {
    conditions.iter().find(|c| c.r#type == r#type)
}
