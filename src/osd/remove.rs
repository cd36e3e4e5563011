//! OSD Removal / Replacement Engine
//!
//! Walks a purged OSD out of the cluster safely: out, safe-to-destroy wait,
//! daemon teardown, PVC policy, purge, CRUSH cleanup, crash-report
//! archiving. Destruction for replacement additionally wipes the backing
//! block and reports where it was so the same id can be recreated in place.

use crate::ceph::client::MonClient;
use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::osd::volume;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Pause between safe-to-destroy probes.
pub const SAFE_DESTROY_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Give up waiting for safe-to-destroy after this many probes (48 hours at
/// one-minute granularity). A cluster that cannot drain an OSD in two days
/// needs an operator, not more patience.
pub const SAFE_DESTROY_MAX_RETRIES: u32 = 48 * 60;

// =============================================================================
// Control-plane Seam
// =============================================================================

/// Control-plane operations the remover needs: tearing down the OSD's
/// daemon, its prepare job, and its claims.
#[async_trait]
pub trait DaemonOps: Send + Sync {
    async fn delete_osd_deployment(&self, osd_id: i32) -> Result<()>;

    /// Whether the OSD's daemon was PVC-backed, and if so the data PVC name.
    async fn backing_pvc(&self, osd_id: i32) -> Result<Option<String>>;

    async fn delete_prepare_job(&self, pvc: &str) -> Result<()>;

    /// All PVCs of the device set this PVC belongs to (data, wal, db).
    async fn device_set_pvcs(&self, pvc: &str) -> Result<Vec<String>>;

    /// Strip the ownership label so the orchestrator forgets the claim.
    async fn release_pvc(&self, pvc: &str) -> Result<()>;

    async fn delete_pvc(&self, pvc: &str) -> Result<()>;
}

/// DaemonOps against the real control plane. OSD daemons and prepare jobs
/// are found by the labels the orchestrator stamps on them; device-set
/// membership comes from the claim's own labels.
pub struct KubeDaemonOps {
    deployments: kube::Api<k8s_openapi::api::apps::v1::Deployment>,
    jobs: kube::Api<k8s_openapi::api::batch::v1::Job>,
    pvcs: kube::Api<k8s_openapi::api::core::v1::PersistentVolumeClaim>,
}

/// Label carrying the numeric OSD id on deployments and claims.
pub const OSD_ID_LABEL: &str = "osd-id";
/// Label carrying the device-set name on claims.
pub const DEVICE_SET_LABEL: &str = "device-set";

impl KubeDaemonOps {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            deployments: kube::Api::namespaced(client.clone(), namespace),
            jobs: kube::Api::namespaced(client.clone(), namespace),
            pvcs: kube::Api::namespaced(client, namespace),
        }
    }

    fn ignore_missing(result: kube::Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DaemonOps for KubeDaemonOps {
    async fn delete_osd_deployment(&self, osd_id: i32) -> Result<()> {
        let params = kube::api::ListParams::default().labels(&format!("{OSD_ID_LABEL}={osd_id}"));
        for deployment in self.deployments.list(&params).await? {
            if let Some(name) = deployment.metadata.name.as_deref() {
                info!("deleting osd deployment {}", name);
                Self::ignore_missing(
                    self.deployments
                        .delete(name, &kube::api::DeleteParams::default())
                        .await
                        .map(|_| ()),
                )?;
            }
        }
        Ok(())
    }

    async fn backing_pvc(&self, osd_id: i32) -> Result<Option<String>> {
        let params = kube::api::ListParams::default().labels(&format!("{OSD_ID_LABEL}={osd_id}"));
        let claims = self.pvcs.list(&params).await?;
        Ok(claims
            .items
            .into_iter()
            .find_map(|claim| claim.metadata.name))
    }

    async fn delete_prepare_job(&self, pvc: &str) -> Result<()> {
        let name = format!("osd-prepare-{pvc}");
        Self::ignore_missing(
            self.jobs
                .delete(
                    &name,
                    &kube::api::DeleteParams::background(),
                )
                .await
                .map(|_| ()),
        )
    }

    async fn device_set_pvcs(&self, pvc: &str) -> Result<Vec<String>> {
        let claim = match self.pvcs.get_opt(pvc).await? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let Some(set) = claim
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(DEVICE_SET_LABEL))
            .cloned()
        else {
            return Ok(vec![pvc.to_string()]);
        };

        let params = kube::api::ListParams::default().labels(&format!("{DEVICE_SET_LABEL}={set}"));
        let claims = self.pvcs.list(&params).await?;
        Ok(claims
            .items
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect())
    }

    async fn release_pvc(&self, pvc: &str) -> Result<()> {
        // Clearing the id label detaches the claim without destroying data.
        let patch = serde_json::json!({
            "metadata": {"labels": {OSD_ID_LABEL: serde_json::Value::Null}}
        });
        self.pvcs
            .patch(
                pvc,
                &kube::api::PatchParams::default(),
                &kube::api::Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn delete_pvc(&self, pvc: &str) -> Result<()> {
        Self::ignore_missing(
            self.pvcs
                .delete(pvc, &kube::api::DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }
}

// =============================================================================
// Options & Results
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct RemovalOptions {
    /// Keep the PVCs (whole device set) instead of deleting them.
    pub preserve_pvc: bool,
    /// Skip the safe-to-destroy wait entirely.
    pub force: bool,
    /// Test hook: retry pacing for the safe-to-destroy loop.
    pub retry_interval: Option<Duration>,
}

/// Where a destroyed OSD lived, so the provisioner can recreate the same id
/// on the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementInfo {
    pub id: i32,
    pub path: String,
}

// =============================================================================
// Remover
// =============================================================================

pub struct OsdRemover {
    client: Arc<MonClient>,
    executor: Arc<dyn Executor>,
    daemons: Arc<dyn DaemonOps>,
}

impl OsdRemover {
    pub fn new(
        client: Arc<MonClient>,
        executor: Arc<dyn Executor>,
        daemons: Arc<dyn DaemonOps>,
    ) -> Self {
        Self {
            client,
            executor,
            daemons,
        }
    }

    /// Remove a set of OSDs. Per-OSD failures stop that OSD's removal but
    /// let the rest proceed; the first error is returned.
    pub async fn remove_osds(&self, ids: &[i32], options: &RemovalOptions) -> Result<()> {
        let mut first_error = None;
        for &id in ids {
            if let Err(e) = self.remove_one(id, options).await {
                warn!("removal of osd.{} failed: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn remove_one(&self, id: i32, options: &RemovalOptions) -> Result<()> {
        // An up OSD must be downed by the operator first.
        let dump = self.client.osd_dump().await?;
        if dump.is_up(id) {
            return Err(Error::OsdStillUp { osd_id: id });
        }

        self.client.osd_out(id).await?;
        let host = self.client.osd_host(id).await.unwrap_or_default();

        self.wait_safe_to_destroy(id, options).await?;

        self.daemons.delete_osd_deployment(id).await?;

        if let Some(pvc) = self.daemons.backing_pvc(id).await? {
            self.daemons.delete_prepare_job(&pvc).await?;
            for claim in self.daemons.device_set_pvcs(&pvc).await? {
                if options.preserve_pvc {
                    self.daemons.release_pvc(&claim).await?;
                } else {
                    self.daemons.delete_pvc(&claim).await?;
                }
            }
        }

        self.client.osd_purge(id).await?;

        if !host.is_empty() {
            // Refused when other OSDs still live on the host; that is fine.
            self.client.crush_remove(&host).await?;
        }

        self.client.archive_osd_crashes(id).await?;
        info!("osd.{} fully removed", id);
        Ok(())
    }

    async fn wait_safe_to_destroy(&self, id: i32, options: &RemovalOptions) -> Result<()> {
        if options.force {
            warn!("skipping safe-to-destroy wait for osd.{} (forced)", id);
            return Ok(());
        }

        let interval = options.retry_interval.unwrap_or(SAFE_DESTROY_RETRY_INTERVAL);
        for attempt in 0..SAFE_DESTROY_MAX_RETRIES {
            if self.client.osd_safe_to_destroy(id).await? {
                return Ok(());
            }
            if attempt % 10 == 0 {
                info!(
                    "waiting for osd.{} to become safe to destroy (attempt {})",
                    id,
                    attempt + 1
                );
            }
            tokio::time::sleep(interval).await;
        }
        Err(Error::UnsafeToDestroy { osd_id: id })
    }

    /// Destroy an OSD in place for replacement: keep the id reserved, wipe
    /// the backing block, and report its path.
    pub async fn destroy_osd(&self, id: i32, encrypted: bool) -> Result<ReplacementInfo> {
        let provisioned = volume::list_provisioned(self.executor.as_ref()).await?;
        let osd = provisioned
            .into_iter()
            .find(|o| o.id == id)
            .ok_or_else(|| Error::DeviceNotFound {
                device: format!("backing block for osd.{id}"),
            })?;

        self.client.osd_destroy(id).await?;

        if encrypted {
            let mapping = format!("ceph-{}-block-dmcrypt", osd.uuid);
            let args = vec!["remove".to_string(), "--force".to_string(), mapping.clone()];
            if let Err(e) = self.executor.execute("dmsetup", &args).await {
                warn!("could not remove dm-crypt mapping {}: {}", mapping, e);
            }
        }

        // Zap the real block device, not the mapper path.
        let path = osd
            .devices
            .first()
            .cloned()
            .unwrap_or_else(|| osd.data_path.clone());
        volume::zap(self.executor.as_ref(), &path).await?;

        Ok(ReplacementInfo { id, path })
    }
}
