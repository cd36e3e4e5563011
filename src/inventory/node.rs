//! Node Configuration
//!
//! Per-node records kept in the orchestration state store: identity, network
//! address, discovered hardware, and heartbeat freshness. Freshness is never
//! derived from timestamps (clocks may be skewed); a node is fresh while its
//! heartbeat key's TTL keeps it alive in the store.

use crate::error::Result;
use crate::inventory::device::DeviceDescriptor;
use crate::orchestration::store::{heartbeat_key, node_config_key, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Minimum interval between hardware refreshes for a node. Hardware change
/// notifications arriving faster than this are absorbed.
pub const MIN_HARDWARE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Node Config
// =============================================================================

/// A node known to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub node_id: String,
    /// Address peers and daemons reach this node on.
    #[serde(default)]
    pub public_ip: String,
    /// Cluster-internal address, when distinct from the public one.
    #[serde(default)]
    pub cluster_ip: String,
    /// CRUSH location tokens for this node, e.g. `root=default host=node1`.
    #[serde(default)]
    pub location: Vec<String>,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Devices eligible for OSD use on this node, reserved block-client
    /// names excluded regardless of any filter.
    pub fn available_devices(&self) -> Vec<&DeviceDescriptor> {
        self.devices
            .iter()
            .filter(|d| !d.is_reserved_block_client() && d.is_available_for_osd())
            .collect()
    }
}

// =============================================================================
// Store Access
// =============================================================================

/// Persist a node's discovered configuration.
pub async fn save_node_config(
    store: &dyn KvStore,
    cluster: &str,
    config: &NodeConfig,
) -> Result<()> {
    let encoded = serde_json::to_string(config)?;
    store
        .put(&node_config_key(cluster, &config.node_id), &encoded)
        .await?;
    debug!(
        "saved config for node {} ({} devices)",
        config.node_id,
        config.devices.len()
    );
    Ok(())
}

/// Load every node whose config is recorded under the cluster, keeping only
/// nodes whose heartbeat key is still live.
pub async fn load_healthy_nodes(
    store: &dyn KvStore,
    cluster: &str,
) -> Result<BTreeMap<String, NodeConfig>> {
    let prefix = format!("/{cluster}/discovered/nodes");
    let mut nodes = BTreeMap::new();

    for (key, raw) in store.list(&prefix).await? {
        if !key.ends_with("/config") {
            continue;
        }
        let config: NodeConfig = match serde_json::from_str(&raw.value) {
            Ok(c) => c,
            Err(e) => {
                warn!("skipping unparseable node config at {}: {}", key, e);
                continue;
            }
        };

        // The heartbeat key carries the TTL; its absence means stale.
        let fresh = store
            .get(&heartbeat_key(cluster, &config.node_id))
            .await?
            .is_some();
        if !fresh {
            debug!("skipping stale node {}", config.node_id);
            continue;
        }

        nodes.insert(config.node_id.clone(), config);
    }

    Ok(nodes)
}

/// Record that a node is alive. The TTL is the staleness horizon.
pub async fn write_heartbeat(
    store: &dyn KvStore,
    cluster: &str,
    node_id: &str,
    ttl: Duration,
) -> Result<()> {
    store
        .put_with_ttl(&heartbeat_key(cluster, node_id), "alive", ttl)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::device::{DeviceDescriptor, DeviceType};
    use crate::orchestration::store::MemoryKvStore;

    fn node_with_devices(id: &str) -> NodeConfig {
        let mut node = NodeConfig::new(id);
        node.public_ip = "10.0.0.1".into();
        node.devices = vec![
            DeviceDescriptor {
                name: "sda".into(),
                size_bytes: 100 << 30,
                device_type: DeviceType::Disk,
                empty: true,
                ..Default::default()
            },
            DeviceDescriptor {
                name: "rbd0".into(),
                size_bytes: 10 << 30,
                device_type: DeviceType::Disk,
                empty: true,
                ..Default::default()
            },
            DeviceDescriptor {
                name: "sda1".into(),
                size_bytes: 10 << 30,
                device_type: DeviceType::Part,
                parent: "sda".into(),
                ..Default::default()
            },
        ];
        node
    }

    #[test]
    fn test_available_devices_excludes_reserved_and_partitions() {
        let node = node_with_devices("n1");
        let available = node.available_devices();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name, "sda");
    }

    #[tokio::test]
    async fn test_config_round_trip_and_heartbeat_gating() {
        let store = MemoryKvStore::new();
        let n1 = node_with_devices("n1");
        let n2 = node_with_devices("n2");

        save_node_config(store.as_ref(), "ceph", &n1).await.unwrap();
        save_node_config(store.as_ref(), "ceph", &n2).await.unwrap();
        write_heartbeat(store.as_ref(), "ceph", "n1", Duration::from_secs(3600))
            .await
            .unwrap();

        // n2 never heartbeated, so it does not load.
        let nodes = load_healthy_nodes(store.as_ref(), "ceph").await.unwrap();
        assert_eq!(nodes.len(), 1);
        let loaded = &nodes["n1"];
        assert_eq!(loaded.public_ip, "10.0.0.1");
        assert_eq!(loaded.devices.len(), 3);
    }

    #[tokio::test]
    async fn test_expired_heartbeat_marks_node_stale() {
        let store = MemoryKvStore::new();
        let n1 = node_with_devices("n1");
        save_node_config(store.as_ref(), "ceph", &n1).await.unwrap();
        write_heartbeat(store.as_ref(), "ceph", "n1", Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let nodes = load_healthy_nodes(store.as_ref(), "ceph").await.unwrap();
        assert!(nodes.is_empty());
    }
}
