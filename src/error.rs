//! Error types for the Ceph orchestrator
//!
//! Provides structured error types for all orchestrator components including
//! the state store, leader election, OSD provisioning, and KMS adapters.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // =========================================================================
    // State Store Errors
    // =========================================================================
    /// The backing KV/API is unreachable or returned a transport-level error.
    #[error("State store error: {0}")]
    Store(String),

    /// A compare-and-swap lost the race; the caller must re-plan from the
    /// latest observed index.
    #[error("Compare failed on key {key}: expected index {expected}")]
    CompareFailed { key: String, expected: u64 },

    /// The backing store garbage-collected the watch index; the watcher must
    /// refresh with a plain get.
    #[error("Watch index reset on key {key}")]
    IndexReset { key: String },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Leadership Errors
    // =========================================================================
    #[error("Not the leader for cluster {cluster}")]
    NotLeader { cluster: String },

    #[error("Lease renewal failed for {name}: {reason}")]
    LeaseRenewal { name: String, reason: String },

    // =========================================================================
    // Inventory / Device Errors
    // =========================================================================
    #[error("Hardware discovery failed: {0}")]
    HardwareDiscovery(String),

    #[error("Device unavailable: {device} ({reason})")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    // =========================================================================
    // OSD Provisioning Errors
    // =========================================================================
    #[error("OSD provisioning failed on {node}: {reason}")]
    Provisioning { node: String, reason: String },

    #[error("Partition scheme conflict for osd.{osd_id}: {reason}")]
    SchemeConflict { osd_id: i32, reason: String },

    #[error("OSD {osd_id} is not safe to destroy")]
    UnsafeToDestroy { osd_id: i32 },

    #[error("OSD {osd_id} is still up, it must be marked down before removal")]
    OsdStillUp { osd_id: i32 },

    // =========================================================================
    // Child Process Errors
    // =========================================================================
    #[error("Command {command} failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Mon command {command} failed: {reason}")]
    MonCommand { command: String, reason: String },

    // =========================================================================
    // KMS Errors
    // =========================================================================
    #[error("KMS error ({provider}): {reason}")]
    Kms { provider: String, reason: String },

    #[error("KMS connection detail {detail} is missing for provider {provider}")]
    KmsMissingDetail { provider: String, detail: String },

    // =========================================================================
    // Peer Mapping Errors
    // =========================================================================
    #[error("Malformed peer token: {0}")]
    PeerToken(String),

    // =========================================================================
    // Agent Orchestration Errors
    // =========================================================================
    #[error("Agent fan-out incomplete: {succeeded}/{required} nodes succeeded")]
    AgentsIncomplete { succeeded: usize, required: usize },

    #[error("Timed out waiting for agent completion after {0:?}")]
    AgentWaitTimeout(Duration),

    // =========================================================================
    // Cancellation
    // =========================================================================
    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Store(_) | Error::Kube(_) | Error::Http(_) | Error::IndexReset { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Someone else won the race - re-plan on the next pass
            Error::CompareFailed { .. } | Error::NotLeader { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(5))
            }

            // Semi-transient: the operator may force, or wait for data migration
            Error::UnsafeToDestroy { .. } | Error::OsdStillUp { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // The device set will not change until inventory changes
            Error::DeviceUnavailable { .. } => ErrorAction::NoRequeue,

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::PeerToken(_)
            | Error::KmsMissingDetail { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Kube(_) | Error::Http(_) | Error::IndexReset { .. }
        )
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
