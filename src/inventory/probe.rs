//! Inventory Probe
//!
//! Enumerates local block devices from sysfs and enriches each candidate
//! with filesystem, mount, and symlink details via `lsblk` and `udevadm`.
//! The probe is the only component that touches the host directly; everything
//! downstream works from the [`DeviceDescriptor`] list it produces.

use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::inventory::device::{DeviceDescriptor, DeviceType};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Probe Configuration
// =============================================================================

/// Configuration for the inventory probe
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Include loopback devices
    pub include_loopback: bool,
    /// Minimum device size to include (bytes)
    pub min_size_bytes: u64,
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            include_loopback: false,
            min_size_bytes: 1_000_000_000,
            sysfs_path: PathBuf::from("/sys"),
        }
    }
}

// =============================================================================
// Inventory Probe
// =============================================================================

/// Scans local block devices and builds descriptors for the provisioner.
pub struct InventoryProbe {
    config: ProbeConfig,
    executor: Arc<dyn Executor>,
}

impl InventoryProbe {
    pub fn new(config: ProbeConfig, executor: Arc<dyn Executor>) -> Self {
        Self { config, executor }
    }

    /// Discover all local block devices.
    pub async fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        let block_path = self.config.sysfs_path.join("class/block");
        if !block_path.exists() {
            return Err(Error::HardwareDiscovery(
                "block device sysfs not found".into(),
            ));
        }

        let mut devices = Vec::new();

        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if !self.should_include_device(&name) {
                continue;
            }

            match self.probe_device(&entry.path(), &name).await {
                Ok(device) => {
                    // Whole-disk minimum size; partitions are kept so their
                    // parents can be judged for exclusive ownership.
                    if device.parent.is_empty() && device.size_bytes < self.config.min_size_bytes {
                        debug!("skipping {}: below minimum size", name);
                        continue;
                    }
                    devices.push(device);
                }
                Err(e) => {
                    warn!("failed to probe device {}: {}", name, e);
                }
            }
        }

        devices.sort_by(|a, b| a.name.cmp(&b.name));
        info!("discovered {} block devices", devices.len());
        Ok(devices)
    }

    /// Build the descriptor for one device.
    async fn probe_device(&self, sysfs_path: &Path, name: &str) -> Result<DeviceDescriptor> {
        // Structural facts come from sysfs.
        let sectors: u64 = self
            .read_sysfs_attr(sysfs_path, "size")?
            .trim()
            .parse()
            .map_err(|_| Error::HardwareDiscovery(format!("invalid size for {name}")))?;
        let size_bytes = sectors * 512;

        let rotational = self
            .read_sysfs_attr(sysfs_path, "queue/rotational")
            .map(|v| v.trim() == "1")
            .unwrap_or(false);
        let read_only = self
            .read_sysfs_attr(sysfs_path, "ro")
            .map(|v| v.trim() == "1")
            .unwrap_or(false);
        let is_partition = sysfs_path.join("partition").exists();
        let has_children = self.has_children(sysfs_path, name);

        // Filesystem, mount point, and parentage come from lsblk.
        let props = self.lsblk_properties(name).await?;
        let filesystem = props.get("FSTYPE").cloned().unwrap_or_default();
        let mountpoint = props.get("MOUNTPOINT").cloned().unwrap_or_default();
        let parent = props
            .get("PKNAME")
            .map(|p| p.trim_start_matches("/dev/").to_string())
            .unwrap_or_default();

        let device_type = if is_partition {
            DeviceType::Part
        } else {
            match props.get("TYPE").map(String::as_str) {
                Some(t) => DeviceType::parse(t),
                None if rotational => DeviceType::Disk,
                None => DeviceType::Ssd,
            }
        };

        let (stable_id, dev_links) = self.udev_identity(name).await;

        Ok(DeviceDescriptor {
            name: name.to_string(),
            stable_id,
            dev_links,
            size_bytes,
            rotational,
            read_only,
            empty: filesystem.is_empty() && !has_children,
            filesystem,
            mountpoint,
            device_type,
            parent,
            has_children,
        })
    }

    /// Query `lsblk` for one device, parsed from `KEY="value"` pairs.
    async fn lsblk_properties(&self, name: &str) -> Result<HashMap<String, String>> {
        let args: Vec<String> = [
            &format!("/dev/{name}"),
            "--bytes",
            "--nodeps",
            "--pairs",
            "--output",
            "SIZE,ROTA,RO,TYPE,PKNAME,NAME,KNAME,MOUNTPOINT,FSTYPE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let output = self.executor.execute("lsblk", &args).await?;
        Ok(parse_key_value_pairs(&output))
    }

    /// Stable identifier and symlink list via udev, best effort.
    async fn udev_identity(&self, name: &str) -> (String, Vec<String>) {
        let args: Vec<String> = ["info", "--query=property", &format!("/dev/{name}")]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let output = match self.executor.execute("udevadm", &args).await {
            Ok(o) => o,
            Err(e) => {
                debug!("udevadm lookup failed for {}: {}", name, e);
                return (String::new(), Vec::new());
            }
        };

        let mut stable_id = String::new();
        let mut dev_links = Vec::new();
        for line in output.lines() {
            if let Some(serial) = line.strip_prefix("ID_SERIAL=") {
                stable_id = serial.trim().to_string();
            } else if let Some(links) = line.strip_prefix("DEVLINKS=") {
                dev_links = links.split_whitespace().map(|s| s.to_string()).collect();
            }
        }
        (stable_id, dev_links)
    }

    /// Whether the device has partitions or holders under it.
    fn has_children(&self, sysfs_path: &Path, name: &str) -> bool {
        let holders = sysfs_path.join("holders");
        if let Ok(mut entries) = fs::read_dir(&holders) {
            if entries.next().is_some() {
                return true;
            }
        }

        // Child partitions appear as subdirectories named after the parent.
        if let Ok(entries) = fs::read_dir(sysfs_path) {
            for entry in entries.flatten() {
                let child = entry.file_name().to_string_lossy().to_string();
                if child != name && child.starts_with(name) {
                    return true;
                }
            }
        }
        false
    }

    fn should_include_device(&self, name: &str) -> bool {
        if !self.config.include_loopback && name.starts_with("loop") {
            return false;
        }
        if name.starts_with("ram") || name.starts_with("zram") || name.starts_with("md") {
            return false;
        }
        if name.starts_with("dm-") {
            return false;
        }
        true
    }

    fn read_sysfs_attr(&self, base_path: &Path, attr: &str) -> Result<String> {
        let path = base_path.join(attr);
        fs::read_to_string(&path)
            .map_err(|e| Error::HardwareDiscovery(format!("failed to read {}: {}", path.display(), e)))
    }
}

/// Parse `KEY="value"` pairs as emitted by `lsblk --pairs`.
fn parse_key_value_pairs(output: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for token in output.split_whitespace() {
        let Some((key, quoted)) = token.split_once('=') else {
            continue;
        };
        let value = quoted.trim_matches('"');
        if !value.is_empty() {
            props.insert(key.to_string(), value.to_string());
        }
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::MockExecutor;
    use std::fs;
    use tempfile::TempDir;

    fn write_sysfs_device(root: &Path, name: &str, sectors: u64, rotational: bool) {
        let dev = root.join("class/block").join(name);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("size"), sectors.to_string()).unwrap();
        fs::create_dir_all(dev.join("queue")).unwrap();
        fs::write(
            dev.join("queue/rotational"),
            if rotational { "1" } else { "0" },
        )
        .unwrap();
        fs::write(dev.join("ro"), "0").unwrap();
    }

    fn lsblk_line(name: &str, fstype: &str, devtype: &str) -> String {
        format!(
            "SIZE=\"107374182400\" ROTA=\"1\" RO=\"0\" TYPE=\"{devtype}\" PKNAME=\"\" \
             NAME=\"/dev/{name}\" KNAME=\"/dev/{name}\" MOUNTPOINT=\"\" FSTYPE=\"{fstype}\""
        )
    }

    fn probe_with(root: &TempDir, exec: MockExecutor) -> InventoryProbe {
        let config = ProbeConfig {
            sysfs_path: root.path().to_path_buf(),
            min_size_bytes: 0,
            ..Default::default()
        };
        InventoryProbe::new(config, Arc::new(exec))
    }

    #[test]
    fn test_parse_key_value_pairs() {
        let props = parse_key_value_pairs(
            "SIZE=\"100\" TYPE=\"disk\" FSTYPE=\"\" MOUNTPOINT=\"\" PKNAME=\"\"",
        );
        assert_eq!(props.get("SIZE").unwrap(), "100");
        assert_eq!(props.get("TYPE").unwrap(), "disk");
        // Empty values are dropped rather than kept as empty strings.
        assert!(!props.contains_key("FSTYPE"));
    }

    #[tokio::test]
    async fn test_discover_builds_descriptors() {
        let root = TempDir::new().unwrap();
        write_sysfs_device(root.path(), "sda", 209715200, true);
        write_sysfs_device(root.path(), "sdb", 209715200, false);

        let exec = MockExecutor::new(|cmd, args| match cmd {
            "lsblk" => {
                let name = args[0].trim_start_matches("/dev/").to_string();
                let fstype = if name == "sdb" { "ext4" } else { "" };
                Ok(lsblk_line(&name, fstype, "disk"))
            }
            "udevadm" => Ok("ID_SERIAL=WD-1234\nDEVLINKS=/dev/disk/by-id/wwn-0x5000\n".into()),
            other => panic!("unexpected command {other}"),
        });

        let probe = probe_with(&root, exec);
        let devices = probe.discover().await.unwrap();

        assert_eq!(devices.len(), 2);
        let sda = &devices[0];
        assert_eq!(sda.name, "sda");
        assert_eq!(sda.size_bytes, 209715200 * 512);
        assert!(sda.rotational);
        assert!(sda.empty);
        assert_eq!(sda.stable_id, "WD-1234");
        assert_eq!(sda.dev_links, vec!["/dev/disk/by-id/wwn-0x5000"]);
        assert!(sda.is_available_for_osd());

        let sdb = &devices[1];
        assert_eq!(sdb.filesystem, "ext4");
        assert!(!sdb.empty);
        assert!(!sdb.is_available_for_osd());
    }

    #[tokio::test]
    async fn test_partition_gets_parent_and_type() {
        let root = TempDir::new().unwrap();
        write_sysfs_device(root.path(), "sda1", 2097152, true);
        fs::write(
            root.path().join("class/block/sda1").join("partition"),
            "1",
        )
        .unwrap();

        let exec = MockExecutor::new(|cmd, _| match cmd {
            "lsblk" => Ok(
                "SIZE=\"1073741824\" ROTA=\"1\" RO=\"0\" TYPE=\"part\" PKNAME=\"/dev/sda\" \
                 NAME=\"/dev/sda1\" KNAME=\"/dev/sda1\" MOUNTPOINT=\"\" FSTYPE=\"\""
                    .into(),
            ),
            _ => Ok(String::new()),
        });

        let probe = probe_with(&root, exec);
        let devices = probe.discover().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_type, DeviceType::Part);
        assert_eq!(devices[0].parent, "sda");
        assert!(!devices[0].is_available_for_osd());
    }

    #[tokio::test]
    async fn test_pseudo_devices_excluded() {
        let root = TempDir::new().unwrap();
        write_sysfs_device(root.path(), "loop0", 209715200, false);
        write_sysfs_device(root.path(), "ram0", 209715200, false);
        write_sysfs_device(root.path(), "dm-0", 209715200, false);

        let probe = probe_with(&root, MockExecutor::ok());
        let devices = probe.discover().await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn test_device_with_partitions_not_empty() {
        let root = TempDir::new().unwrap();
        write_sysfs_device(root.path(), "sda", 209715200, true);
        fs::create_dir_all(root.path().join("class/block/sda/sda1")).unwrap();

        let exec = MockExecutor::new(|cmd, _| match cmd {
            "lsblk" => Ok(lsblk_line("sda", "", "disk")),
            _ => Ok(String::new()),
        });

        let probe = probe_with(&root, exec);
        let devices = probe.discover().await.unwrap();
        assert!(devices[0].has_children);
        assert!(!devices[0].empty);
    }
}
