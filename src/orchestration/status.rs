//! Orchestration status machine
//!
//! Per-node, per-agent progress recorded in the state store. The sequence of
//! observed values for a key is a subsequence of
//! `NotTriggered -> Triggered -> Running -> (Succeeded | Failed)`, possibly
//! pre-empted by `Abort`. Unrecognised strings surface as `Unknown`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a triggered agent on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationStatus {
    NotTriggered,
    Triggered,
    Running,
    Succeeded,
    Failed,
    Abort,
    Unknown,
}

impl OrchestrationStatus {
    /// Wire form written to the state store. `NotTriggered` is the empty
    /// string so that an absent key and a reset key read the same.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::NotTriggered => "",
            OrchestrationStatus::Triggered => "triggered",
            OrchestrationStatus::Running => "running",
            OrchestrationStatus::Succeeded => "succeeded",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::Abort => "abort",
            OrchestrationStatus::Unknown => "unknown",
        }
    }

    /// Parse the wire form. Unrecognised input is `Unknown`, never an error.
    pub fn parse(s: &str) -> Self {
        match s {
            "" => OrchestrationStatus::NotTriggered,
            "triggered" => OrchestrationStatus::Triggered,
            "running" => OrchestrationStatus::Running,
            "succeeded" => OrchestrationStatus::Succeeded,
            "failed" => OrchestrationStatus::Failed,
            "abort" => OrchestrationStatus::Abort,
            _ => OrchestrationStatus::Unknown,
        }
    }

    /// Terminal statuses end the current orchestration cycle for the node.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Succeeded
                | OrchestrationStatus::Failed
                | OrchestrationStatus::Abort
        )
    }

    /// Whether `next` is a legal successor within one cycle. `Abort` may
    /// pre-empt any non-terminal state.
    pub fn can_transition_to(&self, next: OrchestrationStatus) -> bool {
        use OrchestrationStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Abort) => true,
            (NotTriggered, Triggered) => true,
            (Triggered, Running) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(self, OrchestrationStatus::NotTriggered) {
            write!(f, "not-triggered")
        } else {
            write!(f, "{}", self.as_str())
        }
    }
}

/// Per-node provisioning phase surfaced while an OSD agent runs. These are
/// informational sub-states of `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisioningPhase {
    ComputingDiff,
    Orchestrating,
    Completed,
    Failed,
}

impl fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningPhase::ComputingDiff => write!(f, "computingDiff"),
            ProvisioningPhase::Orchestrating => write!(f, "orchestrating"),
            ProvisioningPhase::Completed => write!(f, "completed"),
            ProvisioningPhase::Failed => write!(f, "failed"),
        }
    }
}
