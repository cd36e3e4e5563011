//! Refresh Coalescer
//!
//! Debounces bursts of reconcile triggers into a single delayed
//! orchestration cycle and guarantees at most one in-flight cycle per
//! cluster. Immediate events (node added, node unhealthy) skip the delay but
//! are suppressed entirely while a delayed refresh is pending, since the
//! upcoming full refresh handles them implicitly.

use crate::error::Result;
use crate::inventory::node::NodeConfig;
use crate::orchestration::events::{EventBus, OrchestrationEvent};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Collaborator Seams
// =============================================================================

/// Answers whether this process currently leads the cluster.
#[async_trait]
pub trait LeadershipProbe: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// Reloads the node inventory before a full refresh fans out.
#[async_trait]
pub trait InventoryLoader: Send + Sync {
    async fn load_nodes(&self) -> Result<BTreeMap<String, NodeConfig>>;
}

// =============================================================================
// Refresh Coalescer
// =============================================================================

/// Default debounce window for bursty triggers.
pub const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(5);

pub struct RefreshCoalescer {
    leadership: Arc<dyn LeadershipProbe>,
    inventory: Arc<dyn InventoryLoader>,
    bus: Arc<EventBus>,
    /// Pending trigger count. Only the 0 -> 1 transition schedules the
    /// delayed run; the run swaps the counter back to 0.
    pending: Arc<AtomicU32>,
    delay: Duration,
}

impl RefreshCoalescer {
    pub fn new(
        leadership: Arc<dyn LeadershipProbe>,
        inventory: Arc<dyn InventoryLoader>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Self::with_delay(leadership, inventory, bus, DEFAULT_REFRESH_DELAY)
    }

    pub fn with_delay(
        leadership: Arc<dyn LeadershipProbe>,
        inventory: Arc<dyn InventoryLoader>,
        bus: Arc<EventBus>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            leadership,
            inventory,
            bus,
            pending: Arc::new(AtomicU32::new(0)),
            delay,
        })
    }

    /// Request a full orchestration cycle. Returns whether the trigger was
    /// accepted (joined or scheduled); non-leaders always refuse.
    pub async fn trigger_refresh(self: &Arc<Self>) -> bool {
        if !self.leadership.is_leader().await {
            return false;
        }

        let previous = self.pending.fetch_add(1, Ordering::SeqCst);
        if previous > 0 {
            debug!(
                "refresh already pending ({} triggers coalesced)",
                previous + 1
            );
            return true;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_after_delay().await;
        });
        true
    }

    /// A node joined: fan out immediately, unless a delayed refresh is
    /// already pending (it will cover the new node).
    pub async fn trigger_node_added(self: &Arc<Self>, node_id: &str) -> bool {
        self.trigger_immediate(OrchestrationEvent::AddNode {
            node_id: node_id.to_string(),
        })
        .await
    }

    /// A node became unhealthy: same suppression rules as node-added.
    pub async fn trigger_node_unhealthy(self: &Arc<Self>, node_id: &str) -> bool {
        self.trigger_immediate(OrchestrationEvent::UnhealthyNode {
            node_id: node_id.to_string(),
        })
        .await
    }

    async fn trigger_immediate(self: &Arc<Self>, event: OrchestrationEvent) -> bool {
        if !self.leadership.is_leader().await {
            return false;
        }
        if self.pending.load(Ordering::SeqCst) > 0 {
            debug!(
                "suppressing immediate {} event: full refresh pending",
                event.name()
            );
            return true;
        }
        self.bus.publish(&event);
        true
    }

    /// Number of coalesced triggers currently pending (tests).
    pub fn pending_triggers(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    async fn run_after_delay(self: Arc<Self>) {
        tokio::time::sleep(self.delay).await;

        let coalesced = self.pending.swap(0, Ordering::SeqCst);

        // Leadership may have moved while we slept.
        if !self.leadership.is_leader().await {
            info!("abandoning refresh cycle: leadership lost during debounce");
            return;
        }

        let nodes = match self.inventory.load_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("failed to load inventory for refresh: {}", e);
                return;
            }
        };

        info!(
            "starting orchestration cycle ({} triggers coalesced, {} nodes)",
            coalesced,
            nodes.len()
        );
        self.bus.publish(&OrchestrationEvent::Refresh { nodes });
    }
}
