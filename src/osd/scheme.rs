//! Partition Scheme
//!
//! The persisted record of how each OSD's partitions are laid out on disk.
//! For a given OSD id the scheme is append-only after first successful
//! creation; `fs_created` records that the OSD filesystem exists and its
//! state files were backed up, so re-runs repair instead of recreating.

use crate::error::{Error, Result};
use crate::orchestration::store::{scheme_key, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

// =============================================================================
// Roles & Store Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    Block,
    Db,
    Wal,
    Data,
    Journal,
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionRole::Block => "block",
            PartitionRole::Db => "db",
            PartitionRole::Wal => "wal",
            PartitionRole::Data => "data",
            PartitionRole::Journal => "journal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Bluestore,
    Filestore,
}

impl StoreType {
    /// The partition roles this store type lays down.
    pub fn roles(&self) -> &'static [PartitionRole] {
        match self {
            StoreType::Bluestore => &[PartitionRole::Block, PartitionRole::Db, PartitionRole::Wal],
            StoreType::Filestore => &[PartitionRole::Data, PartitionRole::Journal],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreType::Bluestore => "bluestore",
            StoreType::Filestore => "filestore",
        }
    }
}

// =============================================================================
// Scheme Entries
// =============================================================================

/// One partition of one OSD.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDetail {
    pub device: String,
    pub partition_uuid: String,
    pub size_mb: u64,
    pub offset_mb: u64,
}

/// Partition layout for one OSD.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeEntry {
    pub id: i32,
    pub osd_uuid: String,
    pub store_type: StoreType,
    pub partitions: BTreeMap<PartitionRole, PartitionDetail>,
    /// Set once the OSD filesystem was created and its state files backed
    /// up. A true flag means re-runs must repair, never recreate.
    #[serde(default)]
    pub fs_created: bool,
}

impl SchemeEntry {
    /// Every device this entry touches.
    pub fn devices(&self) -> BTreeSet<&str> {
        self.partitions.values().map(|p| p.device.as_str()).collect()
    }

    /// The data-carrying partition for the entry's store type.
    pub fn data_partition(&self) -> Option<&PartitionDetail> {
        let role = match self.store_type {
            StoreType::Bluestore => PartitionRole::Block,
            StoreType::Filestore => PartitionRole::Data,
        };
        self.partitions.get(&role)
    }
}

/// The node's full persisted partition scheme.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionScheme {
    pub entries: Vec<SchemeEntry>,
}

impl PartitionScheme {
    pub fn entry(&self, osd_id: i32) -> Option<&SchemeEntry> {
        self.entries.iter().find(|e| e.id == osd_id)
    }

    pub fn entry_mut(&mut self, osd_id: i32) -> Option<&mut SchemeEntry> {
        self.entries.iter_mut().find(|e| e.id == osd_id)
    }

    /// Append a new OSD's layout. An existing id can only be re-added with
    /// the identical `(id, uuid)` pair; anything else is a conflict.
    pub fn append(&mut self, entry: SchemeEntry) -> Result<()> {
        if let Some(existing) = self.entry(entry.id) {
            if existing.osd_uuid != entry.osd_uuid {
                return Err(Error::SchemeConflict {
                    osd_id: entry.id,
                    reason: format!(
                        "uuid {} already recorded, refusing to rebind to {}",
                        existing.osd_uuid, entry.osd_uuid
                    ),
                });
            }
            debug!("scheme entry for osd.{} already present", entry.id);
            return Ok(());
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Record that the filesystem for an OSD was created and backed up.
    pub fn mark_fs_created(&mut self, osd_id: i32) -> Result<()> {
        match self.entry_mut(osd_id) {
            Some(entry) => {
                entry.fs_created = true;
                Ok(())
            }
            None => Err(Error::SchemeConflict {
                osd_id,
                reason: "no scheme entry to mark".into(),
            }),
        }
    }

    /// Devices the scheme uses that are no longer in the desired set. These
    /// are slated for removal on the next orchestration pass.
    pub fn removed_devices(&self, desired: &BTreeSet<String>) -> Vec<String> {
        let mut removed: BTreeSet<String> = BTreeSet::new();
        for entry in &self.entries {
            for device in entry.devices() {
                if !desired.contains(device) {
                    removed.insert(device.to_string());
                }
            }
        }
        removed.into_iter().collect()
    }

    /// OSD ids whose data device is among `devices`.
    pub fn osds_on_devices(&self, devices: &[String]) -> Vec<i32> {
        self.entries
            .iter()
            .filter(|e| {
                e.data_partition()
                    .map(|p| devices.contains(&p.device))
                    .unwrap_or(false)
            })
            .map(|e| e.id)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub async fn load(store: &dyn KvStore, cluster: &str, node_id: &str) -> Result<Self> {
        match store.get(&scheme_key(cluster, node_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw.value)?),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, store: &dyn KvStore, cluster: &str, node_id: &str) -> Result<()> {
        let encoded = serde_json::to_string(self)?;
        store.put(&scheme_key(cluster, node_id), &encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::store::MemoryKvStore;

    fn entry(id: i32, uuid: &str, device: &str) -> SchemeEntry {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            PartitionRole::Block,
            PartitionDetail {
                device: device.to_string(),
                partition_uuid: format!("{uuid}-block"),
                size_mb: 0,
                offset_mb: 0,
            },
        );
        SchemeEntry {
            id,
            osd_uuid: uuid.to_string(),
            store_type: StoreType::Bluestore,
            partitions,
            fs_created: false,
        }
    }

    #[test]
    fn test_append_is_idempotent_for_same_uuid() {
        let mut scheme = PartitionScheme::default();
        scheme.append(entry(1, "u1", "sda")).unwrap();
        scheme.append(entry(1, "u1", "sda")).unwrap();
        assert_eq!(scheme.entries.len(), 1);
    }

    #[test]
    fn test_append_conflicting_uuid_rejected() {
        let mut scheme = PartitionScheme::default();
        scheme.append(entry(1, "u1", "sda")).unwrap();
        let err = scheme.append(entry(1, "u2", "sda")).unwrap_err();
        assert!(matches!(err, Error::SchemeConflict { osd_id: 1, .. }));
    }

    #[test]
    fn test_removed_devices() {
        let mut scheme = PartitionScheme::default();
        scheme.append(entry(1, "u1", "sda")).unwrap();
        scheme.append(entry(2, "u2", "sdb")).unwrap();

        let desired: BTreeSet<String> = ["sda".to_string()].into();
        assert_eq!(scheme.removed_devices(&desired), vec!["sdb".to_string()]);
        assert_eq!(scheme.osds_on_devices(&["sdb".to_string()]), vec![2]);
    }

    #[test]
    fn test_store_type_roles() {
        assert_eq!(
            StoreType::Bluestore.roles(),
            &[PartitionRole::Block, PartitionRole::Db, PartitionRole::Wal]
        );
        assert_eq!(
            StoreType::Filestore.roles(),
            &[PartitionRole::Data, PartitionRole::Journal]
        );
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let store = MemoryKvStore::new();
        let mut scheme = PartitionScheme::default();
        scheme.append(entry(7, "u7", "sdc")).unwrap();
        scheme.mark_fs_created(7).unwrap();
        scheme.save(store.as_ref(), "ceph", "n1").await.unwrap();

        let loaded = PartitionScheme::load(store.as_ref(), "ceph", "n1")
            .await
            .unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert!(loaded.entry(7).unwrap().fs_created);

        // Unknown node loads an empty scheme.
        let fresh = PartitionScheme::load(store.as_ref(), "ceph", "n2")
            .await
            .unwrap();
        assert!(fresh.entries.is_empty());
    }
}
