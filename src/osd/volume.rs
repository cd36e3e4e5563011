//! ceph-volume Integration
//!
//! The native provisioning helper does the LVM setup, partitioning, and
//! filesystem creation; the orchestrator hands it a device batch and parses
//! its JSON inventory afterwards. It is treated as a trusted child process.

use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::osd::scheme::StoreType;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Environment variable the helper reads the key-encryption-key from when
/// preparing an encrypted block.
pub const KEK_ENV_VAR: &str = "CEPH_VOLUME_DMCRYPT_SECRET";

// =============================================================================
// Provisioned OSDs
// =============================================================================

/// One OSD as reported by the helper after a successful prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedOsd {
    pub id: i32,
    pub uuid: String,
    pub data_path: String,
    pub devices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LvmListEntry {
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    lv_path: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default, rename = "type")]
    lv_type: String,
}

// =============================================================================
// Helper Invocations
// =============================================================================

/// Batch-prepare a set of devices. Already-prepared devices are accepted by
/// the helper and simply reported back on the next `list`.
pub async fn prepare_batch(
    executor: &dyn Executor,
    devices: &[String],
    metadata_device: Option<&str>,
    store_type: StoreType,
    kek: Option<&str>,
) -> Result<()> {
    if devices.is_empty() {
        return Ok(());
    }

    let mut args: Vec<String> = vec![
        "lvm".into(),
        "batch".into(),
        "--prepare".into(),
        format!("--{}", store_type.as_str()),
        "--yes".into(),
    ];
    if kek.is_some() {
        args.push("--dmcrypt".into());
    }
    for device in devices {
        args.push(format!("/dev/{device}"));
    }
    if let Some(md) = metadata_device {
        args.push("--db-devices".into());
        args.push(format!("/dev/{md}"));
    }

    info!(
        "preparing {} device(s) via ceph-volume ({})",
        devices.len(),
        store_type.as_str()
    );

    let mut env = BTreeMap::new();
    if let Some(kek) = kek {
        env.insert(KEK_ENV_VAR.to_string(), kek.to_string());
    }
    executor.execute_with_env("ceph-volume", &args, &env).await?;
    Ok(())
}

/// List OSDs the helper has prepared on this node, parsed from its JSON
/// inventory. Only data-carrying volumes produce entries.
pub async fn list_provisioned(executor: &dyn Executor) -> Result<Vec<ProvisionedOsd>> {
    let args: Vec<String> = ["lvm", "list", "--format", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let out = executor.execute("ceph-volume", &args).await?;

    let raw: BTreeMap<String, Vec<LvmListEntry>> = serde_json::from_str(out.trim())?;
    let mut osds = Vec::new();

    for (id_str, volumes) in raw {
        let id: i32 = id_str
            .parse()
            .map_err(|_| Error::Internal(format!("non-numeric osd id {id_str:?} from helper")))?;

        for volume in volumes {
            if volume.lv_type != "block" && volume.lv_type != "data" {
                continue;
            }
            let uuid = volume
                .tags
                .get("ceph.osd_fsid")
                .cloned()
                .unwrap_or_default();
            if uuid.is_empty() {
                debug!("ignoring untagged volume for osd {}", id);
                continue;
            }
            osds.push(ProvisionedOsd {
                id,
                uuid,
                data_path: volume.lv_path.clone(),
                devices: volume.devices.clone(),
            });
        }
    }

    osds.sort_by_key(|o| o.id);
    Ok(osds)
}

/// Wipe a backing block completely.
pub async fn zap(executor: &dyn Executor, path: &str) -> Result<()> {
    let args: Vec<String> = ["lvm", "zap", path, "--destroy"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    executor.execute("ceph-volume", &args).await?;
    info!("zapped {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::MockExecutor;

    const LIST_OUTPUT: &str = r#"{
        "0": [
            {
                "devices": ["/dev/sdb"],
                "lv_path": "/dev/ceph-vg/osd-block-0",
                "tags": {"ceph.osd_fsid": "aaaa-bbbb", "ceph.type": "block"},
                "type": "block"
            },
            {
                "devices": ["/dev/nvme01"],
                "lv_path": "/dev/ceph-vg/osd-db-0",
                "tags": {"ceph.osd_fsid": "aaaa-bbbb"},
                "type": "db"
            }
        ],
        "3": [
            {
                "devices": ["/dev/sdc"],
                "lv_path": "/dev/ceph-vg/osd-block-3",
                "tags": {"ceph.osd_fsid": "cccc-dddd"},
                "type": "block"
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_list_parses_data_volumes_only() {
        let exec = MockExecutor::new(|_, _| Ok(LIST_OUTPUT.into()));
        let osds = list_provisioned(&exec).await.unwrap();

        assert_eq!(osds.len(), 2);
        assert_eq!(osds[0].id, 0);
        assert_eq!(osds[0].uuid, "aaaa-bbbb");
        assert_eq!(osds[0].data_path, "/dev/ceph-vg/osd-block-0");
        assert_eq!(osds[0].devices, vec!["/dev/sdb"]);
        assert_eq!(osds[1].id, 3);
    }

    #[tokio::test]
    async fn test_prepare_batch_args() {
        let exec = MockExecutor::ok();
        prepare_batch(
            &exec,
            &["sda".to_string(), "sdb".to_string()],
            Some("nvme01"),
            StoreType::Bluestore,
            None,
        )
        .await
        .unwrap();

        let call = exec.invocations_of("ceph-volume").remove(0);
        assert!(call.contains("lvm batch --prepare --bluestore --yes"));
        assert!(call.contains("/dev/sda"));
        assert!(call.contains("/dev/sdb"));
        assert!(call.contains("--db-devices /dev/nvme01"));
        assert!(!call.contains("--dmcrypt"));
    }

    #[tokio::test]
    async fn test_encrypted_prepare_exports_kek() {
        let exec = MockExecutor::ok();
        prepare_batch(
            &exec,
            &["sda".to_string()],
            None,
            StoreType::Bluestore,
            Some("sealed-key-bytes"),
        )
        .await
        .unwrap();

        let call = exec.invocations_of("ceph-volume").remove(0);
        assert!(call.contains("--dmcrypt"));

        let envs = exec.env_seen.lock();
        assert_eq!(envs[0].get(KEK_ENV_VAR).unwrap(), "sealed-key-bytes");
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let exec = MockExecutor::ok();
        prepare_batch(&exec, &[], None, StoreType::Bluestore, None)
            .await
            .unwrap();
        assert_eq!(exec.call_count(), 0);
    }
}
