//! Event Bus
//!
//! Typed events delivered to per-service leaders over bounded channels.
//! Delivery is FIFO within a service's channel; on overflow the newest event
//! is dropped with a warning and the next full refresh catches up.

use crate::inventory::node::NodeConfig;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// =============================================================================
// Events
// =============================================================================

/// Events fanned out to per-service leaders.
#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    /// Full refresh: reconcile everything against current inventory.
    Refresh { nodes: BTreeMap<String, NodeConfig> },
    /// A node joined the cluster.
    AddNode { node_id: String },
    /// A node was removed from the cluster.
    RemoveNode { node_id: String },
    /// A node's heartbeat TTL ran low; it may be gone.
    StaleNode { node_id: String },
    /// A node is reachable but failing its services.
    UnhealthyNode { node_id: String },
}

impl OrchestrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationEvent::Refresh { .. } => "refresh",
            OrchestrationEvent::AddNode { .. } => "add-node",
            OrchestrationEvent::RemoveNode { .. } => "remove-node",
            OrchestrationEvent::StaleNode { .. } => "stale-node",
            OrchestrationEvent::UnhealthyNode { .. } => "unhealthy-node",
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Default per-service channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Registry of per-service event channels, keyed by service name. Services
/// register on leadership acquisition and are deregistered (closing their
/// channels) on leadership loss.
pub struct EventBus {
    channels: DashMap<String, mpsc::Sender<OrchestrationEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            capacity,
        })
    }

    /// Register a service and return the receiving side of its channel.
    /// Re-registering replaces the previous channel (the old receiver sees
    /// a close).
    pub fn register(&self, service: &str) -> mpsc::Receiver<OrchestrationEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels.insert(service.to_string(), tx);
        debug!("registered event channel for service {}", service);
        rx
    }

    /// Remove a service's channel, closing it.
    pub fn deregister(&self, service: &str) {
        self.channels.remove(service);
        debug!("deregistered event channel for service {}", service);
    }

    /// Close every channel. Invoked on leadership loss.
    pub fn close_all(&self) {
        self.channels.clear();
    }

    pub fn service_count(&self) -> usize {
        self.channels.len()
    }

    /// Fan an event out to every registered service. Full channels drop the
    /// event for that service; the count of deliveries is returned.
    pub fn publish(&self, event: &OrchestrationEvent) -> usize {
        let mut delivered = 0;
        for entry in self.channels.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "dropping {} event for service {}: channel full",
                        event.name(),
                        entry.key()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(
                        "service {} channel closed, skipping {} event",
                        entry.key(),
                        event.name()
                    );
                }
            }
        }
        delivered
    }

    /// Publish to a single service.
    pub fn publish_to(&self, service: &str, event: OrchestrationEvent) -> bool {
        match self.channels.get(service) {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => true,
                Err(e) => {
                    warn!("failed to deliver event to service {}: {}", service, e);
                    false
                }
            },
            None => false,
        }
    }
}
