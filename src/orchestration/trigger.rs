//! Agent Trigger / Completion Tracker
//!
//! Fans a "configure" instruction out to N nodes by writing trigger keys,
//! then waits for every node to report a terminal status. Watchers tolerate
//! index resets (the backing store may garbage-collect old indices) by
//! refreshing with a plain get.

use crate::error::{Error, Result};
use crate::orchestration::status::OrchestrationStatus;
use crate::orchestration::store::{agent_status_key, node_status_key, KvStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Default outer bound on the whole fan-out.
pub const DEFAULT_COMPLETION_WAIT: Duration = Duration::from_secs(120);

/// Inner bound on any single node's completion.
pub const PER_NODE_WAIT: Duration = Duration::from_secs(300);

/// Upper bound on a single blocking watch read.
const WATCH_READ_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Completion Result
// =============================================================================

/// Outcome of a fan-out: how many nodes reached `Succeeded`, and the first
/// error if the required threshold was not met.
#[derive(Debug)]
pub struct CompletionResult {
    pub succeeded: usize,
    pub error: Option<Error>,
}

impl CompletionResult {
    pub fn met_threshold(&self) -> bool {
        self.error.is_none()
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Trigger `agent` on every node and wait for terminal statuses.
///
/// Each node's status key is set to `Triggered` along with the generic node
/// progress key; either write failing aborts the fan-out. One watcher per
/// node then blocks until it observes `Succeeded` or `Failed`, bounded by
/// [`PER_NODE_WAIT`] per node and `wait` overall.
pub async fn trigger_agents_and_wait(
    store: Arc<dyn KvStore>,
    cluster: &str,
    node_ids: &[String],
    agent: &str,
    required_success: usize,
    wait: Duration,
) -> Result<CompletionResult> {
    // Phase 1: write trigger keys. A failure here aborts the whole fan-out.
    for node in node_ids {
        store
            .put(
                &agent_status_key(cluster, node, agent),
                OrchestrationStatus::Triggered.as_str(),
            )
            .await?;
        store
            .put(&node_status_key(cluster, node), "triggered")
            .await?;
    }

    // Phase 2: one watcher per node, rejoined below.
    let successes = Arc::new(AtomicUsize::new(0));
    let mut watchers = JoinSet::new();
    let deadline = Instant::now() + wait;

    for node in node_ids {
        let store = store.clone();
        let key = agent_status_key(cluster, node, agent);
        let node = node.clone();
        let successes = successes.clone();

        watchers.spawn(async move {
            match wait_for_terminal(store, &key, deadline).await {
                Ok(OrchestrationStatus::Succeeded) => {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
                Ok(status) => {
                    warn!("node {} finished agent run with status {}", node, status);
                }
                Err(e) => {
                    warn!("watcher for node {} gave up: {}", node, e);
                }
            }
        });
    }

    while let Some(joined) = watchers.join_next().await {
        if let Err(e) = joined {
            warn!("agent watcher panicked: {}", e);
        }
    }

    // Phase 3: compare against the threshold.
    let succeeded = successes.load(Ordering::SeqCst);
    let error = if succeeded < required_success {
        Some(Error::AgentsIncomplete {
            succeeded,
            required: required_success,
        })
    } else {
        None
    };

    Ok(CompletionResult { succeeded, error })
}

/// Block until the status key reaches a terminal value or the deadline
/// passes. The status key is monotone within a cycle, so observing any
/// terminal value ends the wait.
async fn wait_for_terminal(
    store: Arc<dyn KvStore>,
    key: &str,
    outer_deadline: Instant,
) -> Result<OrchestrationStatus> {
    use backoff::backoff::Backoff;

    let node_deadline = Instant::now() + PER_NODE_WAIT;
    let deadline = outer_deadline.min(node_deadline);
    let mut last_index = 0u64;
    let mut reset_backoff = backoff::ExponentialBackoff {
        initial_interval: Duration::from_millis(20),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        // A fresh get both initializes and recovers the watch index.
        if let Some(v) = store.get(key).await? {
            let status = OrchestrationStatus::parse(&v.value);
            if status.is_terminal() {
                return Ok(status);
            }
            last_index = v.modified_index;
        }

        let remaining = match deadline.checked_duration_since(Instant::now()) {
            Some(d) if !d.is_zero() => d.min(WATCH_READ_TIMEOUT),
            _ => return Err(Error::AgentWaitTimeout(PER_NODE_WAIT)),
        };

        match store.watch(key, last_index, remaining).await {
            Ok(Some(v)) => {
                let status = OrchestrationStatus::parse(&v.value);
                debug!("status update on {}: {}", key, status);
                if status.is_terminal() {
                    return Ok(status);
                }
                last_index = v.modified_index;
            }
            Ok(None) => {
                // Read timed out; loop re-checks the overall deadline.
            }
            Err(Error::IndexReset { .. }) => {
                // The store dropped our index; refresh with a plain get on
                // the next iteration, backing off between resets.
                last_index = 0;
                if let Some(pause) = reset_backoff.next_backoff() {
                    tokio::time::sleep(pause).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::store::MemoryKvStore;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn drive_status(
        store: Arc<MemoryKvStore>,
        node: &str,
        terminal: OrchestrationStatus,
    ) {
        let key = agent_status_key("ceph", node, "osd");
        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .put(&key, OrchestrationStatus::Running.as_str())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.put(&key, terminal.as_str()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fanout_threshold_met() {
        let store = MemoryKvStore::new();

        for (node, status) in [
            ("n1", OrchestrationStatus::Succeeded),
            ("n2", OrchestrationStatus::Failed),
            ("n3", OrchestrationStatus::Succeeded),
        ] {
            tokio::spawn(drive_status(store.clone(), node, status));
        }

        let result = trigger_agents_and_wait(
            store.clone(),
            "ceph",
            &nodes(&["n1", "n2", "n3"]),
            "osd",
            2,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.succeeded, 2);
        assert!(result.met_threshold());
    }

    #[tokio::test]
    async fn test_fanout_threshold_missed() {
        let store = MemoryKvStore::new();

        for (node, status) in [
            ("n1", OrchestrationStatus::Succeeded),
            ("n2", OrchestrationStatus::Failed),
            ("n3", OrchestrationStatus::Succeeded),
        ] {
            tokio::spawn(drive_status(store.clone(), node, status));
        }

        let result = trigger_agents_and_wait(
            store.clone(),
            "ceph",
            &nodes(&["n1", "n2", "n3"]),
            "osd",
            3,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.succeeded, 2);
        assert!(matches!(
            result.error,
            Some(Error::AgentsIncomplete {
                succeeded: 2,
                required: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_trigger_keys_written() {
        let store = MemoryKvStore::new();
        tokio::spawn(drive_status(
            store.clone(),
            "n1",
            OrchestrationStatus::Succeeded,
        ));

        trigger_agents_and_wait(
            store.clone(),
            "ceph",
            &nodes(&["n1"]),
            "osd",
            1,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let progress = store
            .get(&node_status_key("ceph", "n1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.value, "triggered");
    }

    #[tokio::test]
    async fn test_watcher_recovers_from_index_reset() {
        let store = MemoryKvStore::new();
        let key = agent_status_key("ceph", "n1", "osd");
        store
            .put(&key, OrchestrationStatus::Triggered.as_str())
            .await
            .unwrap();

        // Invalidate all indices the watcher could hold, then complete.
        let s = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            s.reset_watch_floor(1000);
            tokio::time::sleep(Duration::from_millis(10)).await;
            s.put(&key, OrchestrationStatus::Succeeded.as_str())
                .await
                .unwrap();
        });

        let result = trigger_agents_and_wait(
            store.clone(),
            "ceph",
            &nodes(&["n1"]),
            "osd",
            1,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.succeeded, 1);
    }

    #[tokio::test]
    async fn test_overall_wait_bounds_stuck_nodes() {
        let store = MemoryKvStore::new();

        // n1 never reports terminal status.
        let result = trigger_agents_and_wait(
            store.clone(),
            "ceph",
            &nodes(&["n1"]),
            "osd",
            1,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(result.succeeded, 0);
        assert!(!result.met_threshold());
    }
}
