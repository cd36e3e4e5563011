//! OSD Configuration & State Files
//!
//! Renders the cluster config file and bootstrap keyring an OSD reads at
//! startup, and backs up / restores the OSD's small on-disk state files
//! through the orchestration state store so a wiped host can re-mount an
//! existing OSD without recreating it.

use crate::ceph::context::ClusterInfo;
use crate::error::{Error, Result};
use crate::orchestration::store::{osd_backup_key, KvStore};
use crate::osd::scheme::{PartitionRole, SchemeEntry};
use base64::Engine;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// State files above this size are regenerated, not backed up.
pub const MAX_BACKUP_FILE_BYTES: u64 = 1 << 20;

/// Files never backed up: the keyring is re-issued by the mon and the
/// config file is re-rendered every cycle.
const EXCLUDED_STATE_FILES: &[&str] = &["keyring", "ceph.conf", "config"];

// =============================================================================
// OSD Config
// =============================================================================

/// Everything the per-node agent knows about one OSD it manages.
#[derive(Debug, Clone)]
pub struct OsdConfig {
    pub id: i32,
    pub uuid: String,
    /// Root directory of the OSD's state files.
    pub root_path: String,
    pub config_path: String,
    pub keyring_path: String,
    /// Whether this OSD is directory-backed rather than device-backed.
    pub dir_backed: bool,
}

// =============================================================================
// Config Rendering
// =============================================================================

/// Render the cluster config file with the OSD's CRUSH location. This file
/// is the ground truth `ceph-osd` reads.
pub fn render_cluster_config(info: &ClusterInfo, crush_location: &[String]) -> String {
    let mut out = String::new();
    out.push_str("[global]\n");
    out.push_str(&format!("fsid = {}\n", info.fsid));
    out.push_str(&format!("mon host = {}\n", info.mon_host()));
    out.push_str("\n[osd]\n");
    if !crush_location.is_empty() {
        out.push_str(&format!("crush location = {}\n", crush_location.join(" ")));
    }
    out
}

pub async fn write_cluster_config(
    info: &ClusterInfo,
    crush_location: &[String],
) -> Result<()> {
    if let Some(parent) = info.conf_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let rendered = render_cluster_config(info, crush_location);
    fs::write(&info.conf_path, rendered).await?;
    debug!("wrote cluster config to {}", info.conf_path.display());
    Ok(())
}

/// Bootstrap keyring with the minimum privileges needed to prepare OSDs.
pub fn render_bootstrap_keyring(key: &str) -> String {
    format!(
        "[client.bootstrap-osd]\n\
         \tkey = {key}\n\
         \tcaps mon = \"allow profile bootstrap-osd\"\n"
    )
}

// =============================================================================
// State File Backup / Restore
// =============================================================================

/// Back up an OSD's small state files to the store. Regenerable files and
/// anything over [`MAX_BACKUP_FILE_BYTES`] are skipped.
pub async fn backup_state_files(
    store: &dyn KvStore,
    cluster: &str,
    node_id: &str,
    osd_id: i32,
    root: &Path,
) -> Result<usize> {
    let mut backed_up = 0;
    let mut entries = fs::read_dir(root).await?;

    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if EXCLUDED_STATE_FILES.contains(&name.as_str()) {
            continue;
        }
        if meta.len() > MAX_BACKUP_FILE_BYTES {
            debug!("skipping backup of {} ({} bytes)", name, meta.len());
            continue;
        }

        let contents = fs::read(entry.path()).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&contents);
        store
            .put(&osd_backup_key(cluster, node_id, osd_id, &name), &encoded)
            .await?;
        backed_up += 1;
    }

    info!("backed up {} state files for osd.{}", backed_up, osd_id);
    Ok(backed_up)
}

/// Restore previously backed-up state files into the OSD root.
pub async fn restore_state_files(
    store: &dyn KvStore,
    cluster: &str,
    node_id: &str,
    osd_id: i32,
    root: &Path,
) -> Result<usize> {
    let prefix = osd_backup_key(cluster, node_id, osd_id, "");
    let keys = store.list(prefix.trim_end_matches('/')).await?;
    fs::create_dir_all(root).await?;

    let mut restored = 0;
    for (key, raw) in keys {
        let Some(name) = key.rsplit('/').next() else {
            continue;
        };
        let contents = base64::engine::general_purpose::STANDARD
            .decode(raw.value.as_bytes())
            .map_err(|e| Error::Internal(format!("corrupt backup for {key}: {e}")))?;
        fs::write(root.join(name), contents).await?;
        restored += 1;
    }

    info!("restored {} state files for osd.{}", restored, osd_id);
    Ok(restored)
}

/// Recreate the block/db/wal symlinks pointing at the partition UUIDs under
/// the by-partuuid path. Needed after a restore, when the links were lost
/// with the root filesystem.
pub async fn recreate_partition_links(entry: &SchemeEntry, root: &Path) -> Result<()> {
    fs::create_dir_all(root).await?;
    for (role, partition) in &entry.partitions {
        // Only bluestore roles are symlinked; filestore data is mounted.
        if !matches!(
            role,
            PartitionRole::Block | PartitionRole::Db | PartitionRole::Wal
        ) {
            continue;
        }
        let link = root.join(role.to_string());
        let target = format!("/dev/disk/by-partuuid/{}", partition.partition_uuid);

        match fs::remove_file(&link).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("could not clear stale link {}: {}", link.display(), e);
            }
        }

        #[cfg(unix)]
        fs::symlink(&target, &link).await?;
        debug!("linked {} -> {}", link.display(), target);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::store::MemoryKvStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn cluster() -> ClusterInfo {
        let mut info = ClusterInfo::new("9f52f713", "ceph", "rook-ceph");
        info.mon_endpoints = vec!["v2:10.0.0.1:3300".into()];
        info
    }

    #[test]
    fn test_render_cluster_config() {
        let rendered = render_cluster_config(
            &cluster(),
            &["root=default".to_string(), "host=node1".to_string()],
        );
        assert!(rendered.contains("fsid = 9f52f713"));
        assert!(rendered.contains("mon host = v2:10.0.0.1:3300"));
        assert!(rendered.contains("crush location = root=default host=node1"));
    }

    #[test]
    fn test_render_bootstrap_keyring() {
        let keyring = render_bootstrap_keyring("AQARzpZh");
        assert!(keyring.contains("[client.bootstrap-osd]"));
        assert!(keyring.contains("key = AQARzpZh"));
        assert!(keyring.contains("allow profile bootstrap-osd"));
    }

    #[tokio::test]
    async fn test_backup_and_restore_round_trip() {
        let store = MemoryKvStore::new();
        let dir = TempDir::new().unwrap();

        std::fs::write(dir.path().join("whoami"), "7").unwrap();
        std::fs::write(dir.path().join("fsid"), "9f52f713").unwrap();
        std::fs::write(dir.path().join("keyring"), "secret").unwrap();
        std::fs::write(dir.path().join("big"), vec![0u8; (MAX_BACKUP_FILE_BYTES + 1) as usize])
            .unwrap();

        let count = backup_state_files(store.as_ref(), "ceph", "n1", 7, dir.path())
            .await
            .unwrap();
        // keyring excluded, big over the cap
        assert_eq!(count, 2);

        let restore_dir = TempDir::new().unwrap();
        let restored = restore_state_files(store.as_ref(), "ceph", "n1", 7, restore_dir.path())
            .await
            .unwrap();
        assert_eq!(restored, 2);
        assert_eq!(
            std::fs::read_to_string(restore_dir.path().join("whoami")).unwrap(),
            "7"
        );
        assert!(!restore_dir.path().join("keyring").exists());
    }

    #[tokio::test]
    async fn test_recreate_partition_links() {
        use crate::osd::scheme::{PartitionDetail, StoreType};

        let dir = TempDir::new().unwrap();
        let mut partitions = BTreeMap::new();
        partitions.insert(
            PartitionRole::Block,
            PartitionDetail {
                device: "sda".into(),
                partition_uuid: "abcd-1234".into(),
                size_mb: 0,
                offset_mb: 0,
            },
        );
        let entry = SchemeEntry {
            id: 7,
            osd_uuid: "u7".into(),
            store_type: StoreType::Bluestore,
            partitions,
            fs_created: true,
        };

        recreate_partition_links(&entry, dir.path()).await.unwrap();
        let link = std::fs::read_link(dir.path().join("block")).unwrap();
        assert_eq!(link.to_string_lossy(), "/dev/disk/by-partuuid/abcd-1234");
    }
}
