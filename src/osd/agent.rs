//! OSD Provisioning Agent
//!
//! The per-node engine invoked once per orchestration cycle. It renders the
//! cluster config, rediscovers hardware, diffs the declared device selection
//! against the persisted partition scheme, drives `ceph-volume` for new
//! devices, registers the results with the mon, and reports terminal status
//! through the state store.
//!
//! Every step is safely re-runnable: already-prepared devices are accepted,
//! existing scheme entries are never recreated, and restarts resume from the
//! persisted scheme and status keys.

use crate::ceph::client::MonClient;
use crate::ceph::context::ClusterInfo;
use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::inventory::device::DeviceDescriptor;
use crate::inventory::probe::InventoryProbe;
use crate::kms::Kms;
use crate::orchestration::status::{OrchestrationStatus, ProvisioningPhase};
use crate::orchestration::store::{
    agent_status_key, applied_osd_key, dir_map_key, provisioning_phase_key, KvStore,
};
use crate::osd::config;
use crate::osd::mapping::{self, DeviceOsdMapping, StorageSelection};
use crate::osd::remove::{OsdRemover, RemovalOptions};
use crate::osd::scheme::{PartitionDetail, PartitionRole, PartitionScheme, SchemeEntry, StoreType};
use crate::osd::volume;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Agent key under which this engine reports status.
pub const OSD_AGENT_NAME: &str = "osd";

// =============================================================================
// Device Source Seam
// =============================================================================

/// Supplies the current local device list. Production uses the inventory
/// probe; tests supply fixtures.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

#[async_trait]
impl DeviceSource for InventoryProbe {
    async fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.discover().await
    }
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// PVC-backed operation: the agent works on a single mounted block.
#[derive(Debug, Clone)]
pub struct PvcBacking {
    /// Claim name, also the KMS key for the KEK.
    pub name: String,
    /// Device path of the mounted block.
    pub device_path: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone)]
pub struct OsdAgentConfig {
    pub node_id: String,
    pub selection: StorageSelection,
    pub directories: Vec<String>,
    pub store_type: StoreType,
    pub crush_location: Vec<String>,
    /// Root for config files, keyrings, and default directory OSDs.
    pub config_root: PathBuf,
    pub pvc: Option<PvcBacking>,
    pub marked_for_removal: bool,
}

// =============================================================================
// Directory Map
// =============================================================================

/// Directory-backed OSDs on this node, persisted across cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryMap {
    pub dirs: BTreeMap<String, DirOsd>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirOsd {
    pub osd_id: i32,
    pub uuid: String,
}

impl DirectoryMap {
    pub async fn load(store: &dyn KvStore, cluster: &str, node_id: &str) -> Result<Self> {
        match store.get(&dir_map_key(cluster, node_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw.value)?),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, store: &dyn KvStore, cluster: &str, node_id: &str) -> Result<()> {
        let encoded = serde_json::to_string(self)?;
        store.put(&dir_map_key(cluster, node_id), &encoded).await?;
        Ok(())
    }
}

// =============================================================================
// Agent
// =============================================================================

pub struct OsdAgent {
    info: ClusterInfo,
    config: OsdAgentConfig,
    store: Arc<dyn KvStore>,
    client: Arc<MonClient>,
    executor: Arc<dyn Executor>,
    devices: Arc<dyn DeviceSource>,
    kms: Option<Arc<dyn Kms>>,
    remover: Option<Arc<OsdRemover>>,
    /// Single-flight guard: at most one configuration run per node.
    running: AtomicBool,
}

impl OsdAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: ClusterInfo,
        config: OsdAgentConfig,
        store: Arc<dyn KvStore>,
        client: Arc<MonClient>,
        executor: Arc<dyn Executor>,
        devices: Arc<dyn DeviceSource>,
        kms: Option<Arc<dyn Kms>>,
        remover: Option<Arc<OsdRemover>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            config,
            store,
            client,
            executor,
            devices,
            kms,
            remover,
            running: AtomicBool::new(false),
        })
    }

    fn cluster(&self) -> &str {
        &self.info.name
    }

    fn node(&self) -> &str {
        &self.config.node_id
    }

    /// Run one full configuration cycle. Returns `false` when another run
    /// is already in flight on this node.
    pub async fn configure(&self) -> Result<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("configuration already in flight on {}", self.node());
            return Ok(false);
        }

        let result = self.configure_inner().await;
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.set_status(OrchestrationStatus::Succeeded).await?;
                Ok(true)
            }
            Err(e) => {
                warn!("osd configuration failed on {}: {}", self.node(), e);
                self.set_phase(ProvisioningPhase::Failed).await.ok();
                self.set_status(OrchestrationStatus::Failed).await.ok();
                Err(e)
            }
        }
    }

    async fn configure_inner(&self) -> Result<()> {
        if self.info.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Phase 1: diff computation begins.
        self.set_status(OrchestrationStatus::Running).await?;
        self.set_phase(ProvisioningPhase::ComputingDiff).await?;

        // Phase 2: the config file ceph-osd reads is ground truth.
        config::write_cluster_config(&self.info, &self.config.crush_location).await?;

        // PVC-backed agents collapse discovery and selection to one block.
        if let Some(pvc) = self.config.pvc.clone() {
            self.set_phase(ProvisioningPhase::Orchestrating).await?;
            self.configure_pvc_osd(&pvc).await?;
            self.set_phase(ProvisioningPhase::Completed).await?;
            return Ok(());
        }

        // Phase 3: rediscover hardware.
        let discovered = self.devices.devices().await?;

        // Phase 4: desired devices, minus foreign encrypted containers.
        let eligible = self.filter_foreign_encrypted(discovered).await?;
        let mut device_mapping = mapping::compute_device_mapping(
            &self.config.selection,
            &eligible,
            self.config.marked_for_removal,
        )?;

        // Phase 5: directory list; default directory when nothing is asked.
        let directories = self.effective_directories(&device_mapping);

        // Phase 6: diff against the persisted scheme.
        let mut scheme = PartitionScheme::load(
            self.store.as_ref(),
            self.cluster(),
            self.node(),
        )
        .await?;
        let desired: BTreeSet<String> = device_mapping
            .entries
            .keys()
            .cloned()
            .collect();
        let removed_devices = scheme.removed_devices(&desired);

        // Phase 7: orchestration proper.
        self.set_phase(ProvisioningPhase::Orchestrating).await?;

        // Phase 8: device-backed OSDs.
        if !device_mapping.is_empty() {
            self.configure_device_osds(&eligible, &mut device_mapping, &mut scheme)
                .await?;
        }

        // Phase 9: directory-backed OSDs.
        let mut dir_map =
            DirectoryMap::load(self.store.as_ref(), self.cluster(), self.node()).await?;
        self.configure_dir_osds(&directories, &mut dir_map).await?;

        // Phase 10: removals.
        if !removed_devices.is_empty() {
            self.remove_device_osds(&scheme, &removed_devices).await?;
        }

        // Phase 11: persist and complete.
        scheme
            .save(self.store.as_ref(), self.cluster(), self.node())
            .await?;
        dir_map
            .save(self.store.as_ref(), self.cluster(), self.node())
            .await?;
        self.set_phase(ProvisioningPhase::Completed).await?;
        info!(
            "osd configuration completed on {}: {} device(s), {} dir(s)",
            self.node(),
            scheme.entries.len(),
            dir_map.dirs.len()
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Device OSDs
    // -------------------------------------------------------------------------

    async fn filter_foreign_encrypted(
        &self,
        devices: Vec<DeviceDescriptor>,
    ) -> Result<Vec<DeviceDescriptor>> {
        let mut eligible = Vec::with_capacity(devices.len());
        for device in devices {
            if device.parent.is_empty()
                && mapping::belongs_to_other_cluster(
                    self.executor.as_ref(),
                    &self.info.fsid,
                    &device.path(),
                )
                .await?
            {
                warn!(
                    "device {} carries another cluster's encrypted container, skipping",
                    device.name
                );
                continue;
            }
            eligible.push(device);
        }
        Ok(eligible)
    }

    async fn configure_device_osds(
        &self,
        discovered: &[DeviceDescriptor],
        device_mapping: &mut DeviceOsdMapping,
        scheme: &mut PartitionScheme,
    ) -> Result<()> {
        self.write_bootstrap_keyring().await?;

        // Devices already carrying a created filesystem are repaired, not
        // re-prepared.
        let mut to_prepare: Vec<String> = Vec::new();
        for name in device_mapping.device_names() {
            let existing = scheme.entries.iter().find(|e| {
                e.data_partition()
                    .map(|p| p.device == name)
                    .unwrap_or(false)
            });
            match existing {
                Some(entry) if entry.fs_created => {
                    self.repair_osd(entry).await?;
                }
                _ => to_prepare.push(name.to_string()),
            }
        }

        let metadata_device = self.config.selection.metadata_device.clone();
        let data_devices: Vec<String> = to_prepare
            .iter()
            .filter(|name| metadata_device.as_deref() != Some(name.as_str()))
            .cloned()
            .collect();

        volume::prepare_batch(
            self.executor.as_ref(),
            &data_devices,
            metadata_device.as_deref(),
            self.config.store_type,
            None,
        )
        .await?;

        // Record what the helper produced and register each OSD.
        let provisioned = volume::list_provisioned(self.executor.as_ref()).await?;
        for osd in provisioned {
            let Some(device_name) = osd
                .devices
                .first()
                .map(|d| d.trim_start_matches("/dev/").to_string())
            else {
                continue;
            };
            let Some(entry) = device_mapping.entries.get_mut(&device_name) else {
                continue;
            };
            entry.data = osd.id;

            let size_bytes = discovered
                .iter()
                .find(|d| d.name == device_name)
                .map(|d| d.size_bytes)
                .unwrap_or_default();

            let mut partitions = BTreeMap::new();
            partitions.insert(
                PartitionRole::Block,
                PartitionDetail {
                    device: device_name.clone(),
                    partition_uuid: osd.uuid.clone(),
                    size_mb: size_bytes / (1 << 20),
                    offset_mb: 0,
                },
            );
            let scheme_entry = SchemeEntry {
                id: osd.id,
                osd_uuid: osd.uuid.clone(),
                store_type: self.config.store_type,
                partitions,
                fs_created: false,
            };

            let newly_created = scheme.entry(osd.id).is_none();
            scheme.append(scheme_entry)?;

            if newly_created {
                self.register_osd(osd.id, size_bytes).await?;
                // A failed backup must abort: marking fs_created without the
                // backed-up state files would leave the repair path nothing
                // to restore from.
                config::backup_state_files(
                    self.store.as_ref(),
                    self.cluster(),
                    self.node(),
                    osd.id,
                    &self.osd_root(osd.id),
                )
                .await?;
                scheme.mark_fs_created(osd.id)?;
            }

            self.store
                .put(
                    &applied_osd_key(self.cluster(), self.node(), osd.id),
                    &osd.uuid,
                )
                .await?;
        }
        Ok(())
    }

    /// Re-run path for an OSD whose filesystem already exists: restore the
    /// backed-up state files and relink partitions, never recreate.
    async fn repair_osd(&self, entry: &SchemeEntry) -> Result<()> {
        info!("repairing existing osd.{} (fs already created)", entry.id);
        let root = self.osd_root(entry.id);
        config::restore_state_files(
            self.store.as_ref(),
            self.cluster(),
            self.node(),
            entry.id,
            &root,
        )
        .await?;
        config::recreate_partition_links(entry, &root).await?;
        Ok(())
    }

    async fn register_osd(&self, id: i32, size_bytes: u64) -> Result<()> {
        let keyring = self.osd_root(id).join("keyring");
        self.client
            .auth_add_osd(id, &keyring.display().to_string())
            .await?;
        self.client
            .crush_create_or_move(id, size_bytes, &self.config.crush_location)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PVC-backed OSDs
    // -------------------------------------------------------------------------

    async fn configure_pvc_osd(&self, pvc: &PvcBacking) -> Result<()> {
        let kek = if pvc.encrypted {
            Some(self.fetch_or_create_kek(&pvc.name).await?)
        } else {
            None
        };

        self.write_bootstrap_keyring().await?;
        volume::prepare_batch(
            self.executor.as_ref(),
            &[pvc.device_path.trim_start_matches("/dev/").to_string()],
            None,
            self.config.store_type,
            kek.as_deref(),
        )
        .await?;

        let provisioned = volume::list_provisioned(self.executor.as_ref()).await?;
        for osd in provisioned {
            self.store
                .put(
                    &applied_osd_key(self.cluster(), self.node(), osd.id),
                    &osd.uuid,
                )
                .await?;
        }
        Ok(())
    }

    /// A KEK failure aborts this OSD's configuration; the caller's other
    /// OSDs proceed independently.
    async fn fetch_or_create_kek(&self, pvc: &str) -> Result<String> {
        let kms = self.kms.as_ref().ok_or_else(|| Error::Kms {
            provider: "none".to_string(),
            reason: format!("encrypted PVC {pvc} but no KMS configured"),
        })?;
        if let Some(existing) = kms.get(pvc).await? {
            return Ok(existing);
        }
        let key = crate::kms::rotation::generate_key();
        kms.put(pvc, &key).await?;
        Ok(key)
    }

    // -------------------------------------------------------------------------
    // Directory OSDs
    // -------------------------------------------------------------------------

    fn effective_directories(&self, device_mapping: &DeviceOsdMapping) -> Vec<String> {
        if !self.config.directories.is_empty() {
            return self.config.directories.clone();
        }
        if device_mapping.is_empty() && !self.config.marked_for_removal {
            // Nothing requested at all: fall back to a default directory
            // under the config root.
            return vec![self
                .config
                .config_root
                .join("osd-dir")
                .display()
                .to_string()];
        }
        Vec::new()
    }

    async fn configure_dir_osds(
        &self,
        directories: &[String],
        dir_map: &mut DirectoryMap,
    ) -> Result<()> {
        for dir in directories {
            if dir_map.dirs.contains_key(dir) {
                debug!("directory {} already hosts an osd", dir);
                continue;
            }
            tokio::fs::create_dir_all(dir).await?;

            let uuid = Uuid::new_v4().to_string();
            let id = self.client.osd_create(&uuid).await?;
            self.register_osd(id, 0).await?;

            dir_map.dirs.insert(
                dir.clone(),
                DirOsd {
                    osd_id: id,
                    uuid: uuid.clone(),
                },
            );
            self.store
                .put(&applied_osd_key(self.cluster(), self.node(), id), &uuid)
                .await?;
            info!("created directory osd.{} at {}", id, dir);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Removal
    // -------------------------------------------------------------------------

    async fn remove_device_osds(
        &self,
        scheme: &PartitionScheme,
        removed_devices: &[String],
    ) -> Result<()> {
        let ids = scheme.osds_on_devices(removed_devices);
        if ids.is_empty() {
            return Ok(());
        }
        let remover = self.remover.as_ref().ok_or_else(|| {
            Error::Provisioning {
                node: self.node().to_string(),
                reason: "devices slated for removal but no remover wired".into(),
            }
        })?;
        info!(
            "removing {} osd(s) from retired devices {:?}",
            ids.len(),
            removed_devices
        );
        remover.remove_osds(&ids, &RemovalOptions::default()).await?;
        for id in ids {
            self.store
                .delete(&applied_osd_key(self.cluster(), self.node(), id))
                .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    fn osd_root(&self, id: i32) -> PathBuf {
        self.config.config_root.join(format!("osd{id}"))
    }

    async fn write_bootstrap_keyring(&self) -> Result<()> {
        let key = self.client.bootstrap_osd_key().await?;
        let dir = self.config.config_root.join("bootstrap-osd");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(
            dir.join("keyring"),
            config::render_bootstrap_keyring(&key),
        )
        .await?;
        Ok(())
    }

    async fn set_status(&self, status: OrchestrationStatus) -> Result<()> {
        self.store
            .put(
                &agent_status_key(self.cluster(), self.node(), OSD_AGENT_NAME),
                status.as_str(),
            )
            .await?;
        Ok(())
    }

    async fn set_phase(&self, phase: ProvisioningPhase) -> Result<()> {
        self.store
            .put(
                &provisioning_phase_key(self.cluster(), self.node()),
                &phase.to_string(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::MockExecutor;
    use crate::inventory::device::DeviceType;
    use crate::kms::test_support::MemoryKms;
    use crate::orchestration::store::MemoryKvStore;
    use tempfile::TempDir;

    struct FixedDevices(Vec<DeviceDescriptor>);

    #[async_trait]
    impl DeviceSource for FixedDevices {
        async fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(self.0.clone())
        }
    }

    fn disk(name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.to_string(),
            size_bytes: 100 << 30,
            device_type: DeviceType::Disk,
            empty: true,
            ..Default::default()
        }
    }

    /// Responds to the full command sequence of a device provisioning run.
    fn provisioning_responder() -> impl Fn(&str, &[String]) -> Result<String> + Send + Sync {
        |cmd, args: &[String]| {
            let joined = args.join(" ");
            match cmd {
                "cryptsetup" => Err(Error::CommandFailed {
                    command: "cryptsetup luksDump".into(),
                    status: 1,
                    stderr: "not a valid LUKS device".into(),
                }),
                "ceph-volume" if joined.contains("list") => Ok(r#"{
                    "0": [{
                        "devices": ["/dev/sdb"],
                        "lv_path": "/dev/ceph-vg/osd-block-0",
                        "tags": {"ceph.osd_fsid": "aaaa-bbbb"},
                        "type": "block"
                    }]
                }"#
                .into()),
                "ceph-volume" => Ok(String::new()),
                "ceph" if joined.contains("get-key") => Ok(r#"{"key": "AQARzpZh"}"#.into()),
                "ceph" => Ok(String::new()),
                other => panic!("unexpected command {other}"),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryKvStore>,
        exec: MockExecutor,
        agent: Arc<OsdAgent>,
        _config_root: TempDir,
    }

    fn fixture(config_mut: impl FnOnce(&mut OsdAgentConfig)) -> Fixture {
        let store = MemoryKvStore::new();
        let exec = MockExecutor::new(provisioning_responder());
        let config_root = TempDir::new().unwrap();
        // The volume helper would have created the osd data dir on prepare.
        std::fs::create_dir_all(config_root.path().join("osd0")).unwrap();

        let mut info = ClusterInfo::new("9f52f713", "ceph", "rook-ceph");
        info.mon_endpoints = vec!["v2:10.0.0.1:3300".into()];
        info.conf_path = config_root.path().join("ceph.conf");
        info.keyring_path = config_root.path().join("ceph.keyring");

        let mut config = OsdAgentConfig {
            node_id: "n1".into(),
            selection: StorageSelection {
                devices: vec![crate::osd::mapping::DesiredDevice {
                    name: "sdb".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            directories: Vec::new(),
            store_type: StoreType::Bluestore,
            crush_location: vec!["root=default".into(), "host=n1".into()],
            config_root: config_root.path().to_path_buf(),
            pvc: None,
            marked_for_removal: false,
        };
        config_mut(&mut config);

        let client = Arc::new(MonClient::new(info.clone(), Arc::new(exec.clone())));
        let agent = OsdAgent::new(
            info,
            config,
            store.clone(),
            client,
            Arc::new(exec.clone()),
            Arc::new(FixedDevices(vec![disk("sdb"), disk("sdc")])),
            Some(MemoryKms::with_key("unused", "x")),
            None,
        );

        Fixture {
            store,
            exec,
            agent,
            _config_root: config_root,
        }
    }

    async fn status(store: &MemoryKvStore) -> OrchestrationStatus {
        let raw = store
            .get(&agent_status_key("ceph", "n1", OSD_AGENT_NAME))
            .await
            .unwrap()
            .unwrap();
        OrchestrationStatus::parse(&raw.value)
    }

    #[tokio::test]
    async fn test_full_device_cycle() {
        let f = fixture(|_| {});
        assert!(f.agent.configure().await.unwrap());

        assert_eq!(status(&f.store).await, OrchestrationStatus::Succeeded);

        // The helper prepared sdb and the mon registered osd.0.
        let volume_calls = f.exec.invocations_of("ceph-volume");
        assert!(volume_calls.iter().any(|c| c.contains("batch --prepare")));
        let ceph_calls = f.exec.invocations_of("ceph");
        assert!(ceph_calls.iter().any(|c| c.contains("auth add osd.0")));
        assert!(ceph_calls
            .iter()
            .any(|c| c.contains("crush create-or-move") && c.contains("host=n1")));

        // The scheme persisted with fs_created set.
        let scheme = PartitionScheme::load(f.store.as_ref(), "ceph", "n1")
            .await
            .unwrap();
        let entry = scheme.entry(0).unwrap();
        assert!(entry.fs_created);
        assert_eq!(entry.data_partition().unwrap().device, "sdb");
    }

    #[tokio::test]
    async fn test_rerun_repairs_instead_of_recreating() {
        let f = fixture(|_| {});
        f.agent.configure().await.unwrap();
        let first_prepares = f
            .exec
            .invocations_of("ceph-volume")
            .iter()
            .filter(|c| c.contains("batch"))
            .count();

        // Second run: the device already has fs_created, so no new batch
        // prepare targets it and no second registration happens.
        f.agent.configure().await.unwrap();
        let second_prepares = f
            .exec
            .invocations_of("ceph-volume")
            .iter()
            .filter(|c| c.contains("batch"))
            .count();
        assert_eq!(first_prepares, second_prepares);

        let auth_adds = f
            .exec
            .invocations_of("ceph")
            .iter()
            .filter(|c| c.contains("auth add osd.0"))
            .count();
        assert_eq!(auth_adds, 1);

        // The same id/uuid pair survived both runs.
        let scheme = PartitionScheme::load(f.store.as_ref(), "ceph", "n1")
            .await
            .unwrap();
        assert_eq!(scheme.entries.len(), 1);
        assert_eq!(scheme.entry(0).unwrap().osd_uuid, "aaaa-bbbb");
    }

    #[tokio::test]
    async fn test_fs_created_requires_state_backup() {
        let f = fixture(|_| {});
        // No osd data dir means the state backup cannot run; the cycle must
        // fail rather than record fs_created with nothing to restore from.
        std::fs::remove_dir(f._config_root.path().join("osd0")).unwrap();

        f.agent.configure().await.unwrap_err();
        assert_eq!(status(&f.store).await, OrchestrationStatus::Failed);

        let scheme = PartitionScheme::load(f.store.as_ref(), "ceph", "n1")
            .await
            .unwrap();
        assert!(scheme.entry(0).is_none());
    }

    #[tokio::test]
    async fn test_single_flight_guard() {
        let f = fixture(|_| {});
        f.agent.running.store(true, Ordering::SeqCst);
        assert!(!f.agent.configure().await.unwrap());
        f.agent.running.store(false, Ordering::SeqCst);
        assert!(f.agent.configure().await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_reports_failed_status() {
        let f = fixture(|_| {});
        // Make every ceph-volume call fail.
        let exec = MockExecutor::new(|cmd, _| match cmd {
            "ceph-volume" => Err(Error::CommandFailed {
                command: "ceph-volume".into(),
                status: 1,
                stderr: "device busy".into(),
            }),
            "cryptsetup" => Err(Error::CommandFailed {
                command: "cryptsetup".into(),
                status: 1,
                stderr: "not LUKS".into(),
            }),
            _ => Ok(r#"{"key": "AQARzpZh"}"#.into()),
        });
        let client = Arc::new(MonClient::new(
            f.agent.info.clone(),
            Arc::new(exec.clone()),
        ));
        let agent = OsdAgent::new(
            f.agent.info.clone(),
            f.agent.config.clone(),
            f.store.clone(),
            client,
            Arc::new(exec),
            Arc::new(FixedDevices(vec![disk("sdb")])),
            None,
            None,
        );

        agent.configure().await.unwrap_err();
        assert_eq!(status(&f.store).await, OrchestrationStatus::Failed);

        let phase = f
            .store
            .get(&provisioning_phase_key("ceph", "n1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(phase.value, "failed");
    }

    #[tokio::test]
    async fn test_pvc_backed_encrypted_exports_kek() {
        let kms = MemoryKms::with_key("set1-data-0", "sealed-kek");
        let f = fixture(|config| {
            config.pvc = Some(PvcBacking {
                name: "set1-data-0".into(),
                device_path: "/dev/xvdf".into(),
                encrypted: true,
            });
        });
        // Swap in a KMS holding the expected key.
        let agent = OsdAgent::new(
            f.agent.info.clone(),
            f.agent.config.clone(),
            f.store.clone(),
            f.agent.client.clone(),
            f.agent.executor.clone(),
            f.agent.devices.clone(),
            Some(kms),
            None,
        );

        agent.configure().await.unwrap();

        let call = f
            .exec
            .invocations_of("ceph-volume")
            .into_iter()
            .find(|c| c.contains("batch"))
            .unwrap();
        assert!(call.contains("--dmcrypt"));
        assert!(call.contains("/dev/xvdf"));

        let envs = f.exec.env_seen.lock();
        assert!(envs
            .iter()
            .any(|e| e.get(volume::KEK_ENV_VAR).map(String::as_str) == Some("sealed-kek")));
    }

    #[tokio::test]
    async fn test_default_directory_when_nothing_requested() {
        let f = fixture(|config| {
            config.selection = StorageSelection::default();
        });
        // No devices match an empty selection; a default dir OSD appears.
        let exec = MockExecutor::new(|cmd, args: &[String]| {
            let joined = args.join(" ");
            match cmd {
                "cryptsetup" => Err(Error::CommandFailed {
                    command: "cryptsetup".into(),
                    status: 1,
                    stderr: "not LUKS".into(),
                }),
                "ceph" if joined.contains("osd create") => Ok(r#"{"osdid": 9}"#.into()),
                "ceph" if joined.contains("get-key") => Ok(r#"{"key": "AQARzpZh"}"#.into()),
                _ => Ok(String::new()),
            }
        });
        let client = Arc::new(MonClient::new(
            f.agent.info.clone(),
            Arc::new(exec.clone()),
        ));
        let agent = OsdAgent::new(
            f.agent.info.clone(),
            f.agent.config.clone(),
            f.store.clone(),
            client,
            Arc::new(exec.clone()),
            Arc::new(FixedDevices(Vec::new())),
            None,
            None,
        );

        agent.configure().await.unwrap();

        let dir_map = DirectoryMap::load(f.store.as_ref(), "ceph", "n1")
            .await
            .unwrap();
        assert_eq!(dir_map.dirs.len(), 1);
        assert!(dir_map.dirs.values().any(|d| d.osd_id == 9));

        // Re-run reuses the same directory OSD.
        agent.configure().await.unwrap();
        let dir_map = DirectoryMap::load(f.store.as_ref(), "ceph", "n1")
            .await
            .unwrap();
        assert_eq!(dir_map.dirs.len(), 1);
    }

    #[tokio::test]
    async fn test_removal_marker_yields_empty_selection() {
        let f = fixture(|config| {
            config.marked_for_removal = true;
        });
        f.agent.configure().await.unwrap();

        // Nothing prepared, nothing registered.
        assert!(f
            .exec
            .invocations_of("ceph-volume")
            .iter()
            .all(|c| !c.contains("batch")));
        let scheme = PartitionScheme::load(f.store.as_ref(), "ceph", "n1")
            .await
            .unwrap();
        assert!(scheme.entries.is_empty());
    }
}
