//! Cluster Member
//!
//! A process-local state machine wrapping the lease manager. Each election
//! pass either renews a held lease or attempts acquisition, writes a
//! heartbeat, and fires leadership callbacks on transition. Callbacks run on
//! the electing task: no two `on_leadership_acquired` calls occur without an
//! intervening `on_leadership_lost`.

use crate::error::Result;
use crate::orchestration::lease::{Lease, LeaseManager};
use crate::orchestration::store::{hardware_detection_key, heartbeat_key, KvStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Leader Callbacks
// =============================================================================

/// Callbacks raised by the member on leadership and membership change.
#[async_trait]
pub trait Leader: Send + Sync {
    /// The lease (and cluster) name this leader competes for.
    fn lease_name(&self) -> String;

    /// Invoked when this member becomes the leader. Side effects: start
    /// event watchers, trigger a full refresh.
    async fn on_leadership_acquired(&self) -> Result<()>;

    /// Invoked when leadership is lost or cannot be confirmed. Side effects:
    /// cancel watchers, close event channels.
    async fn on_leadership_lost(&self) -> Result<()>;

    /// Invoked when a new node's heartbeat is first observed.
    async fn on_node_discovered(&self, node_id: &str) -> Result<()>;
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// TTL requested on lease acquisition and renewal.
    pub lease_ttl: Duration,
    /// Interval between election passes.
    pub election_interval: Duration,
    /// TTL on the per-node heartbeat key. Long: freshness is derived from
    /// remaining TTL, never from timestamps, since clocks may be skewed.
    pub heartbeat_ttl: Duration,
    /// Orchestrator version published in the lease value.
    pub version: u32,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(15),
            election_interval: Duration::from_secs(5),
            heartbeat_ttl: Duration::from_secs(3600),
            version: 1,
        }
    }
}

// =============================================================================
// Cluster Member
// =============================================================================

/// Per-process election participant for one cluster.
pub struct ClusterMember {
    machine_id: String,
    store: Arc<dyn KvStore>,
    lease_manager: LeaseManager,
    leader: Arc<dyn Leader>,
    config: MemberConfig,
    held: tokio::sync::Mutex<Option<Lease>>,
    cancel: CancellationToken,
}

impl ClusterMember {
    pub fn new(
        machine_id: &str,
        store: Arc<dyn KvStore>,
        leader: Arc<dyn Leader>,
        config: MemberConfig,
    ) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            lease_manager: LeaseManager::new(store.clone()),
            store,
            leader,
            config,
            held: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled when the member shuts down; leadership-scoped workers
    /// derive their contexts from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.held.lock().await.is_some()
    }

    /// Write the member's own heartbeat and observe hardware-detection
    /// trigger keys. Performed on every election pass.
    pub async fn initialize(&self) -> Result<()> {
        self.write_heartbeat().await;
        Ok(())
    }

    /// One election pass.
    ///
    /// Any store error during the pass is interpreted conservatively: the
    /// member must assume leadership is lost, clear leader-only state, and
    /// retry on the next tick.
    pub async fn elect_leader(&self) -> Result<()> {
        let lease_name = self.leader.lease_name();
        let mut held = self.held.lock().await;

        let was_leader = held.is_some();

        // Renew a held lease first; a successful renewal keeps leadership
        // without touching the acquisition path.
        if let Some(lease) = held.as_mut() {
            match lease.renew(self.config.lease_ttl).await {
                Ok(()) => {
                    debug!(
                        "renewed lease {} at index {}",
                        lease_name,
                        lease.modified_index()
                    );
                    self.write_heartbeat().await;
                    self.observe_hardware_detection(&lease_name).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!("failed to renew lease {}: {}", lease_name, e);
                    *held = None;
                    self.leader.on_leadership_lost().await?;
                    return Ok(());
                }
            }
        }

        // Not currently holding: look at the lease, then try to take it.
        let outcome: Result<Option<Lease>> = async {
            match self.lease_manager.get_lease(&lease_name).await? {
                Some(holder) if holder.machine_id() != self.machine_id => Ok(None),
                _ => {
                    self.lease_manager
                        .acquire_lease(
                            &lease_name,
                            &self.machine_id,
                            self.config.version,
                            self.config.lease_ttl,
                        )
                        .await
                }
            }
        }
        .await;

        match outcome {
            Ok(Some(lease)) => {
                info!("{} is now the leader for {}", self.machine_id, lease_name);
                *held = Some(lease);
                self.leader.on_leadership_acquired().await?;
            }
            Ok(None) => {
                if was_leader {
                    *held = None;
                    self.leader.on_leadership_lost().await?;
                }
            }
            Err(e) => {
                // Conservative: an election-step store error means we cannot
                // prove leadership.
                warn!("election pass failed for {}: {}", lease_name, e);
                if was_leader {
                    *held = None;
                }
                self.leader.on_leadership_lost().await?;
            }
        }

        self.write_heartbeat().await;
        self.observe_hardware_detection(&lease_name).await;
        Ok(())
    }

    /// Election loop: one pass per interval until cancelled.
    pub async fn refresh_leader(&self) {
        loop {
            if let Err(e) = self.elect_leader().await {
                warn!("election pass error: {}", e);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("member loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.config.election_interval) => {}
            }
        }
    }

    /// Release a held lease and stop the loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let mut held = self.held.lock().await;
        if let Some(lease) = held.take() {
            lease.release().await?;
            self.leader.on_leadership_lost().await?;
        }
        Ok(())
    }

    /// Heartbeat write errors are logged and swallowed; the next tick
    /// retries.
    async fn write_heartbeat(&self) {
        let key = heartbeat_key(&self.leader.lease_name(), &self.machine_id);
        if let Err(e) = self
            .store
            .put_with_ttl(&key, "alive", self.config.heartbeat_ttl)
            .await
        {
            warn!("failed to write heartbeat: {}", e);
        }
    }

    /// External actors force rediscovery by setting a trigger key; the
    /// observer deletes it after processing.
    async fn observe_hardware_detection(&self, cluster: &str) {
        let key = hardware_detection_key(cluster, &self.machine_id);
        match self.store.get(&key).await {
            Ok(Some(_)) => {
                info!("hardware detection triggered for {}", self.machine_id);
                if let Err(e) = self.leader.on_node_discovered(&self.machine_id).await {
                    warn!("hardware detection callback failed: {}", e);
                }
                if let Err(e) = self.store.delete(&key).await {
                    warn!("failed to clear hardware detection trigger: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => debug!("hardware detection check failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::store::MemoryKvStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingLeader {
        transitions: Mutex<Vec<&'static str>>,
        discovered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Leader for RecordingLeader {
        fn lease_name(&self) -> String {
            "ceph".to_string()
        }

        async fn on_leadership_acquired(&self) -> Result<()> {
            self.transitions.lock().push("acquired");
            Ok(())
        }

        async fn on_leadership_lost(&self) -> Result<()> {
            self.transitions.lock().push("lost");
            Ok(())
        }

        async fn on_node_discovered(&self, node_id: &str) -> Result<()> {
            self.discovered.lock().push(node_id.to_string());
            Ok(())
        }
    }

    fn member_for(
        machine_id: &str,
        store: Arc<MemoryKvStore>,
    ) -> (Arc<RecordingLeader>, ClusterMember) {
        let leader = Arc::new(RecordingLeader::default());
        let config = MemberConfig {
            lease_ttl: Duration::from_millis(50),
            election_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let member = ClusterMember::new(machine_id, store, leader.clone(), config);
        (leader, member)
    }

    #[tokio::test]
    async fn test_first_election_acquires() {
        let store = MemoryKvStore::new();
        let (leader, member) = member_for("A", store);

        member.elect_leader().await.unwrap();
        assert!(member.is_leader().await);
        assert_eq!(*leader.transitions.lock(), vec!["acquired"]);
    }

    #[tokio::test]
    async fn test_lease_contention() {
        let store = MemoryKvStore::new();
        let (leader_a, a) = member_for("A", store.clone());
        let (leader_b, b) = member_for("B", store.clone());

        // A acquires first; B's create fails and B stays NotLeader.
        a.elect_leader().await.unwrap();
        b.elect_leader().await.unwrap();

        assert!(a.is_leader().await);
        assert!(!b.is_leader().await);
        assert_eq!(*leader_a.transitions.lock(), vec!["acquired"]);
        assert!(leader_b.transitions.lock().is_empty());

        // A's lease expires without renewal; B's next election acquires it.
        tokio::time::sleep(Duration::from_millis(80)).await;
        b.elect_leader().await.unwrap();
        assert!(b.is_leader().await);
        assert_eq!(*leader_b.transitions.lock(), vec!["acquired"]);
    }

    #[tokio::test]
    async fn test_renewal_keeps_leadership() {
        let store = MemoryKvStore::new();
        let (leader, member) = member_for("A", store);

        member.elect_leader().await.unwrap();
        member.elect_leader().await.unwrap();
        member.elect_leader().await.unwrap();

        assert!(member.is_leader().await);
        // One transition only; renewals do not re-fire the callback.
        assert_eq!(*leader.transitions.lock(), vec!["acquired"]);
    }

    #[tokio::test]
    async fn test_no_double_acquire_without_lost() {
        let store = MemoryKvStore::new();
        let (leader, member) = member_for("A", store.clone());

        member.elect_leader().await.unwrap();

        // Another member steals the lease out from under A.
        let mgr = LeaseManager::new(store.clone());
        let held = mgr.get_lease("ceph").await.unwrap().unwrap();
        mgr.steal_lease(
            "ceph",
            "B",
            1,
            Duration::from_secs(15),
            held.modified_index(),
        )
        .await
        .unwrap()
        .unwrap();

        // A's renewal fails, leadership lost.
        member.elect_leader().await.unwrap();
        assert!(!member.is_leader().await);

        // B releases; A re-acquires on a later pass.
        store
            .delete(&crate::orchestration::store::lease_key("ceph"))
            .await
            .unwrap();
        member.elect_leader().await.unwrap();

        assert_eq!(*leader.transitions.lock(), vec!["acquired", "lost", "acquired"]);
    }

    #[tokio::test]
    async fn test_heartbeat_written_each_pass() {
        let store = MemoryKvStore::new();
        let (_, member) = member_for("A", store.clone());

        member.elect_leader().await.unwrap();
        let hb = store
            .get(&heartbeat_key("ceph", "A"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hb.value, "alive");
    }

    #[tokio::test]
    async fn test_hardware_detection_trigger_cleared() {
        let store = MemoryKvStore::new();
        let (leader, member) = member_for("A", store.clone());

        let key = hardware_detection_key("ceph", "A");
        store.put(&key, "1").await.unwrap();

        member.elect_leader().await.unwrap();

        assert_eq!(*leader.discovered.lock(), vec!["A".to_string()]);
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
