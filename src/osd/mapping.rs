//! Device Selection & Mapping
//!
//! Maps the declared device selection (all / names / regex filter / path
//! filter / metadata device) onto the node's discovered hardware and emits a
//! `DeviceOsdMapping` the provisioner works from. The mapping also persists
//! across cycles as the record of which OSD owns which device.

use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::inventory::device::DeviceDescriptor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Sentinel for a device selected but not yet bound to an OSD id.
pub const UNASSIGNED_OSD: i32 = -1;

// =============================================================================
// Declared Selection
// =============================================================================

/// One explicitly named device from the cluster declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredDevice {
    pub name: String,
    /// Whether `name` is a full `/dev/...` path rather than a short name.
    #[serde(default)]
    pub full_path: bool,
    /// Per-device config overrides (store settings), opaque here.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// The declared storage selection for a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSelection {
    #[serde(default)]
    pub use_all_devices: bool,
    #[serde(default)]
    pub devices: Vec<DesiredDevice>,
    /// Regex over short device names.
    #[serde(default)]
    pub device_filter: Option<String>,
    /// Regex over stable symlink paths.
    #[serde(default)]
    pub device_path_filter: Option<String>,
    /// Device reserved for metadata (db/wal) partitions.
    #[serde(default)]
    pub metadata_device: Option<String>,
}

// =============================================================================
// Device -> OSD Mapping
// =============================================================================

/// Assignment of one device: a data OSD or shared metadata for several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOsdEntry {
    pub data: i32,
    pub metadata: Vec<i32>,
}

impl Default for DeviceOsdEntry {
    fn default() -> Self {
        Self {
            data: UNASSIGNED_OSD,
            metadata: Vec::new(),
        }
    }
}

/// Per-node device assignment, keyed by short device name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOsdMapping {
    pub entries: BTreeMap<String, DeviceOsdEntry>,
}

impl DeviceOsdMapping {
    pub fn insert_unassigned(&mut self, name: &str) {
        self.entries
            .entry(name.to_string())
            .or_insert_with(DeviceOsdEntry::default);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn device_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

// =============================================================================
// Selection Algorithm
// =============================================================================

/// Compute which discovered devices the provisioner should use.
///
/// Selection order per device: reserved block-client names and partitions
/// are never eligible; devices that are not exclusively ours (filesystem
/// present, children present) are skipped; the declared metadata device is
/// recorded as metadata-only; everything else must match the declared
/// selector to be included as data.
pub fn compute_device_mapping(
    selection: &StorageSelection,
    devices: &[DeviceDescriptor],
    node_marked_for_removal: bool,
) -> Result<DeviceOsdMapping> {
    let mut mapping = DeviceOsdMapping::default();
    if node_marked_for_removal {
        return Ok(mapping);
    }

    let name_filter = compile_filter(selection.device_filter.as_deref())?;
    let path_filter = compile_filter(selection.device_path_filter.as_deref())?;

    for device in devices {
        if device.is_reserved_block_client() {
            debug!("ignoring reserved block client device {}", device.name);
            continue;
        }
        if !device.parent.is_empty() {
            continue;
        }

        // Metadata device is recorded even when it fails the data selector.
        if selection.metadata_device.as_deref() == Some(device.name.as_str()) {
            if device.is_available_for_osd() {
                mapping.insert_unassigned(&device.name);
            } else {
                debug!(
                    "declared metadata device {} is not available: {}",
                    device.name,
                    unavailable_reason(device)
                );
            }
            continue;
        }

        if !device.is_available_for_osd() || !device.empty {
            debug!(
                "skipping device {}: {}",
                device.name,
                unavailable_reason(device)
            );
            continue;
        }

        let selected = if selection.use_all_devices {
            true
        } else if let Some(ref re) = name_filter {
            re.is_match(&device.name)
        } else if let Some(ref re) = path_filter {
            device.dev_links.iter().any(|link| re.is_match(link))
        } else {
            selection.devices.iter().any(|d| {
                if d.full_path {
                    d.name == device.path() || device.dev_links.contains(&d.name)
                } else {
                    d.name == device.name
                }
            })
        };

        if selected {
            mapping.insert_unassigned(&device.name);
        }
    }

    info!(
        "device selection matched {} of {} discovered devices",
        mapping.entries.len(),
        devices.len()
    );
    Ok(mapping)
}

fn compile_filter(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|e| Error::Validation(format!("invalid device filter {p:?}: {e}"))),
    }
}

fn unavailable_reason(device: &DeviceDescriptor) -> String {
    if !device.filesystem.is_empty() {
        format!("has filesystem {}", device.filesystem)
    } else if !device.mountpoint.is_empty() {
        format!("mounted at {}", device.mountpoint)
    } else if device.has_children {
        "has partitions".to_string()
    } else if device.read_only {
        "read-only".to_string()
    } else {
        "not a whole empty disk".to_string()
    }
}

// =============================================================================
// Foreign Encrypted Containers
// =============================================================================

/// Whether a LUKS device belongs to some Ceph cluster, and if so which.
///
/// Provisioned encrypted blocks carry `ceph_fsid=<fsid>` in their LUKS
/// subsystem field. A container stamped with a different fsid belongs to
/// another cluster and must never be touched.
pub async fn luks_cluster_fsid(executor: &dyn Executor, device_path: &str) -> Result<Option<String>> {
    let args = vec!["luksDump".to_string(), device_path.to_string()];
    let out = match executor.execute("cryptsetup", &args).await {
        Ok(o) => o,
        // Not a LUKS device at all.
        Err(Error::CommandFailed { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    for line in out.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Subsystem:") {
            if let Some(fsid) = rest.trim().strip_prefix("ceph_fsid=") {
                return Ok(Some(fsid.trim().to_string()));
            }
        }
    }
    Ok(None)
}

/// Filter out encrypted containers stamped by other clusters.
pub async fn belongs_to_other_cluster(
    executor: &dyn Executor,
    our_fsid: &str,
    device_path: &str,
) -> Result<bool> {
    match luks_cluster_fsid(executor, device_path).await? {
        Some(fsid) if fsid != our_fsid => Ok(true),
        _ => Ok(false),
    }
}
