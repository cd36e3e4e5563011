//! Block device model
//!
//! Device descriptors discovered by the probe and the availability rules the
//! OSD provisioner applies to them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// =============================================================================
// Device Type
// =============================================================================

/// Block device type as reported by the kernel / lsblk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Disk,
    Ssd,
    Part,
    Crypt,
    Lvm,
    Loop,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "disk" => DeviceType::Disk,
            "ssd" => DeviceType::Ssd,
            "part" | "partition" => DeviceType::Part,
            "crypt" => DeviceType::Crypt,
            "lvm" => DeviceType::Lvm,
            "loop" => DeviceType::Loop,
            _ => DeviceType::Unknown,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Disk => "disk",
            DeviceType::Ssd => "ssd",
            DeviceType::Part => "part",
            DeviceType::Crypt => "crypt",
            DeviceType::Lvm => "lvm",
            DeviceType::Loop => "loop",
            DeviceType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Device Descriptor
// =============================================================================

/// A discovered local block device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Short kernel name, e.g. `sda` or `nvme0n1`.
    pub name: String,
    /// Stable identifier (by-id symlink target or serial), if known.
    #[serde(default)]
    pub stable_id: String,
    /// Stable symlink paths (`/dev/disk/by-*`), space-separated origins.
    #[serde(default)]
    pub dev_links: Vec<String>,
    pub size_bytes: u64,
    pub rotational: bool,
    pub read_only: bool,
    /// Filesystem signature, empty when none.
    #[serde(default)]
    pub filesystem: String,
    /// Mount point, empty when unmounted.
    #[serde(default)]
    pub mountpoint: String,
    #[serde(default = "default_device_type")]
    pub device_type: DeviceType,
    /// Parent device short name for partitions/mappings, empty for whole
    /// disks.
    #[serde(default)]
    pub parent: String,
    pub has_children: bool,
    /// Whether the device carries no data recognisable to the orchestrator.
    pub empty: bool,
}

fn default_device_type() -> DeviceType {
    DeviceType::Unknown
}

impl DeviceDescriptor {
    /// A device is available for OSD use iff it has no parent, is a whole
    /// disk, and carries no filesystem.
    pub fn is_available_for_osd(&self) -> bool {
        self.parent.is_empty()
            && self.device_type == DeviceType::Disk
            && self.filesystem.is_empty()
            && self.mountpoint.is_empty()
            && !self.read_only
    }

    /// Devices named like the cluster's own block clients (`rbd*`) are never
    /// considered for OSDs, regardless of filter.
    pub fn is_reserved_block_client(&self) -> bool {
        is_reserved_block_client_name(&self.name)
    }

    pub fn path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

/// The kernel names RBD block clients `rbd<N>` with optional partition
/// suffixes.
pub fn is_reserved_block_client_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^rbd[0-9]+p?[0-9]*$").expect("static pattern"));
    re.is_match(name)
}
