//! CephStorageCluster CRD
//!
//! The declared state of one storage cluster: which devices and directories
//! to consume, monitor count, network addressing, encryption policy, and
//! mirroring peers. Mutated only by the user; the core reads it and drives
//! the daemons to match.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::conditions::ClusterCondition;
use crate::osd::mapping::{DesiredDevice, StorageSelection};

// =============================================================================
// CephStorageCluster CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ceph.storageops.io",
    version = "v1",
    kind = "CephStorageCluster",
    plural = "cephstorageclusters",
    shortname = "csc",
    status = "CephStorageClusterStatus",
    printcolumn = r#"{"name": "Mons", "type": "integer", "jsonPath": ".spec.mon.count"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Message", "type": "string", "jsonPath": ".status.message"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CephStorageClusterSpec {
    /// Storage selection across the cluster's nodes.
    #[serde(default)]
    pub storage: StorageSpec,

    /// Monitor deployment settings.
    #[serde(default)]
    pub mon: MonSpec,

    /// Network addressing for daemons.
    #[serde(default)]
    pub network: NetworkSpec,

    /// Encryption and key management policy.
    #[serde(default)]
    pub security: SecuritySpec,

    /// Mirroring peers for pools in this cluster.
    #[serde(default)]
    pub mirroring: MirroringSpec,
}

// =============================================================================
// Storage
// =============================================================================

/// One explicitly named device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub name: String,
    /// Whether `name` is a full `/dev/...` path rather than a short name.
    #[serde(default)]
    pub fullpath: bool,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// One directory to back an OSD.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySpec {
    pub path: String,
}

/// A PVC template set for dynamically provisioned OSD backing volumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassDeviceSet {
    pub name: String,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    /// Volume size, human-readable (e.g. "1Ti").
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Consume every available device on every node.
    #[serde(default)]
    pub use_all_devices: bool,

    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    #[serde(default)]
    pub directories: Vec<DirectorySpec>,

    /// Regex over short device names.
    #[serde(default)]
    pub device_filter: Option<String>,

    /// Regex over stable symlink paths.
    #[serde(default)]
    pub device_path_filter: Option<String>,

    /// Device reserved for metadata (db/wal) partitions.
    #[serde(default)]
    pub metadata_device: Option<String>,

    #[serde(default)]
    pub storage_class_device_sets: Vec<StorageClassDeviceSet>,
}

impl StorageSpec {
    /// The per-node selection the provisioning engine consumes.
    pub fn selection(&self) -> StorageSelection {
        StorageSelection {
            use_all_devices: self.use_all_devices,
            devices: self
                .devices
                .iter()
                .map(|d| DesiredDevice {
                    name: d.name.clone(),
                    full_path: d.fullpath,
                    config: d.config.clone(),
                })
                .collect(),
            device_filter: self.device_filter.clone(),
            device_path_filter: self.device_path_filter.clone(),
            metadata_device: self.metadata_device.clone(),
        }
    }

    pub fn directory_paths(&self) -> Vec<String> {
        self.directories.iter().map(|d| d.path.clone()).collect()
    }
}

// =============================================================================
// Mon / Network / Security / Mirroring
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonSpec {
    #[serde(default = "default_mon_count")]
    pub count: u32,
}

impl Default for MonSpec {
    fn default() -> Self {
        Self {
            count: default_mon_count(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub public_addr: Option<String>,
    #[serde(default)]
    pub cluster_addr: Option<String>,
    #[serde(default)]
    pub public_network: Option<String>,
    #[serde(default)]
    pub cluster_network: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    #[serde(default)]
    pub kms: KmsSpec,
}

/// Declared KMS connection. Mirrors [`crate::kms::KmsConfig`], kept separate
/// so the CRD schema owns its own shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KmsSpec {
    #[serde(default)]
    pub connection_details: BTreeMap<String, String>,
    #[serde(default)]
    pub token_secret_name: Option<String>,
}

impl KmsSpec {
    pub fn to_config(&self) -> crate::kms::KmsConfig {
        crate::kms::KmsConfig {
            connection_details: self.connection_details.clone(),
            token_secret_name: self.token_secret_name.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.connection_details.is_empty() || self.token_secret_name.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MirroringSpec {
    #[serde(default)]
    pub peers: PeerSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerSpec {
    /// Secrets carrying base64 peer bootstrap tokens.
    #[serde(default)]
    pub secret_names: Vec<String>,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Connecting,
    Progressing,
    Ready,
    Error,
    Deleting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephStorageClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable summary, set from the terminating error on failure.
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// FSID of the running cluster, once known.
    #[serde(default)]
    pub fsid: Option<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl CephStorageCluster {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == ClusterPhase::Ready)
            .unwrap_or(false)
    }

    /// Basic shape validation before any reconcile work starts.
    pub fn validate(&self) -> crate::error::Result<()> {
        self.spec.validate()
    }
}

impl CephStorageClusterSpec {
    /// Shared shape checks, enforced identically at admission and at the
    /// start of every reconcile.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        if self.mon.count == 0 {
            return Err(Error::Validation("mon count must be at least 1".into()));
        }
        if self.mon.count % 2 == 0 {
            return Err(Error::Validation(format!(
                "mon count {} must be odd for quorum",
                self.mon.count
            )));
        }
        if self.storage.use_all_devices
            && (self.storage.device_filter.is_some() || !self.storage.devices.is_empty())
        {
            return Err(Error::Validation(
                "useAllDevices excludes explicit device lists and filters".into(),
            ));
        }
        for set in &self.storage.storage_class_device_sets {
            if set.name.is_empty() {
                return Err(Error::Validation(
                    "storageClassDeviceSet requires a name".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_mon_count() -> u32 {
    3
}
