//! Mon Command Client
//!
//! Thin wrappers over the `ceph` CLI for the handful of mon commands the
//! orchestrator issues: OSD registration, CRUSH placement, auth, removal,
//! and crash-report archiving. Every invocation carries the cluster's
//! connection arguments so concurrent clusters never cross.

use crate::ceph::context::ClusterInfo;
use crate::error::{Error, Result};
use crate::exec::Executor;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Weight
// =============================================================================

/// CRUSH weight for a device: its size in TiB, rounded up at the fourth
/// decimal so no real device ever weighs zero.
pub fn crush_weight(size_bytes: u64) -> f64 {
    let tib = size_bytes as f64 / (1024.0 * 1073741824.0);
    (tib * 10000.0).ceil() / 10000.0
}

/// Render a weight the way the CLI expects it.
pub fn format_weight(weight: f64) -> String {
    format!("{weight:.4}")
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct OsdCreateReply {
    osdid: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OsdDumpEntry {
    pub osd: i32,
    pub up: u8,
    #[serde(rename = "in")]
    pub in_cluster: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OsdDump {
    #[serde(default)]
    pub osds: Vec<OsdDumpEntry>,
}

impl OsdDump {
    pub fn is_up(&self, id: i32) -> bool {
        self.osds.iter().any(|o| o.osd == id && o.up != 0)
    }
}

#[derive(Debug, Deserialize)]
struct OsdFindReply {
    #[serde(default)]
    crush_location: CrushLocation,
}

#[derive(Debug, Default, Deserialize)]
struct CrushLocation {
    #[serde(default)]
    host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrashReport {
    pub crash_id: String,
    #[serde(default)]
    pub entity_name: String,
}

// =============================================================================
// Mon Client
// =============================================================================

/// Issues mon commands for one cluster.
pub struct MonClient {
    info: ClusterInfo,
    executor: Arc<dyn Executor>,
}

impl MonClient {
    pub fn new(info: ClusterInfo, executor: Arc<dyn Executor>) -> Self {
        Self { info, executor }
    }

    async fn mon_command(&self, args: &[&str]) -> Result<String> {
        let mut full: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        full.extend(self.info.cli_args());
        self.executor
            .execute("ceph", &full)
            .await
            .map_err(|e| match e {
                Error::CommandFailed { .. } => e,
                other => Error::MonCommand {
                    command: args.join(" "),
                    reason: other.to_string(),
                },
            })
    }

    async fn mon_command_json(&self, args: &[&str]) -> Result<String> {
        let mut with_format: Vec<&str> = args.to_vec();
        with_format.push("--format");
        with_format.push("json");
        self.mon_command(&with_format).await
    }

    /// Register a new OSD bound to `uuid`; the mon assigns the numeric id.
    pub async fn osd_create(&self, uuid: &str) -> Result<i32> {
        let out = self.mon_command_json(&["osd", "create", uuid]).await?;
        let reply: OsdCreateReply = serde_json::from_str(out.trim())?;
        info!("registered osd {} for uuid {}", reply.osdid, uuid);
        Ok(reply.osdid)
    }

    pub async fn osd_dump(&self) -> Result<OsdDump> {
        let out = self.mon_command_json(&["osd", "dump"]).await?;
        Ok(serde_json::from_str(out.trim())?)
    }

    pub async fn osd_out(&self, id: i32) -> Result<()> {
        self.mon_command(&["osd", "out", &format!("osd.{id}")])
            .await?;
        Ok(())
    }

    /// Whether the cluster can lose this OSD without data loss. A rejection
    /// from the mon means "not yet", not a hard failure.
    pub async fn osd_safe_to_destroy(&self, id: i32) -> Result<bool> {
        match self
            .mon_command(&["osd", "safe-to-destroy", &format!("osd.{id}")])
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { stderr, .. }) => {
                debug!("osd.{} not yet safe to destroy: {}", id, stderr);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn osd_purge(&self, id: i32) -> Result<()> {
        self.mon_command(&[
            "osd",
            "purge",
            &id.to_string(),
            "--force",
            "--yes-i-really-mean-it",
        ])
        .await?;
        info!("purged osd.{}", id);
        Ok(())
    }

    pub async fn osd_destroy(&self, id: i32) -> Result<()> {
        self.mon_command(&[
            "osd",
            "destroy",
            &format!("osd.{id}"),
            "--yes-i-really-mean-it",
        ])
        .await?;
        Ok(())
    }

    /// The CRUSH host currently holding this OSD.
    pub async fn osd_host(&self, id: i32) -> Result<String> {
        let out = self
            .mon_command_json(&["osd", "find", &id.to_string()])
            .await?;
        let reply: OsdFindReply = serde_json::from_str(out.trim())?;
        Ok(reply.crush_location.host)
    }

    /// Place the OSD in the CRUSH map with a size-derived weight.
    pub async fn crush_create_or_move(
        &self,
        id: i32,
        size_bytes: u64,
        location: &[String],
    ) -> Result<()> {
        let weight = format_weight(crush_weight(size_bytes));
        let mut args = vec!["osd", "crush", "create-or-move", "--"];
        let id_str = id.to_string();
        args.push(&id_str);
        args.push(&weight);
        for token in location {
            args.push(token);
        }
        self.mon_command(&args).await?;
        info!(
            "placed osd.{} in crush map at {} with weight {}",
            id,
            location.join(","),
            weight
        );
        Ok(())
    }

    /// Remove a CRUSH node; "not found" is fine (other OSDs may still live
    /// under a shared host).
    pub async fn crush_remove(&self, name: &str) -> Result<()> {
        match self.mon_command(&["osd", "crush", "rm", name]).await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { stderr, .. }) => {
                warn!("crush rm {} refused: {}", name, stderr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Grant an OSD its daemon privileges.
    pub async fn auth_add_osd(&self, id: i32, keyring_path: &str) -> Result<()> {
        self.mon_command(&[
            "auth",
            "add",
            &format!("osd.{id}"),
            "osd",
            "allow *",
            "mon",
            "allow profile osd",
            "-i",
            keyring_path,
        ])
        .await?;
        Ok(())
    }

    pub async fn auth_del(&self, entity: &str) -> Result<()> {
        self.mon_command(&["auth", "del", entity]).await?;
        Ok(())
    }

    /// Fetch the bootstrap-osd key used to render per-node keyrings.
    pub async fn bootstrap_osd_key(&self) -> Result<String> {
        let out = self
            .mon_command_json(&["auth", "get-key", "client.bootstrap-osd"])
            .await?;
        #[derive(Deserialize)]
        struct KeyReply {
            key: String,
        }
        let reply: KeyReply = serde_json::from_str(out.trim())?;
        Ok(reply.key)
    }

    /// Archive every crash report filed by `osd.<id>` so removal does not
    /// leave a permanent health warning behind.
    pub async fn archive_osd_crashes(&self, id: i32) -> Result<()> {
        let out = self.mon_command_json(&["crash", "ls"]).await?;
        let reports: Vec<CrashReport> = serde_json::from_str(out.trim()).unwrap_or_default();
        let entity = format!("osd.{id}");

        for report in reports.iter().filter(|r| r.entity_name == entity) {
            if let Err(e) = self
                .mon_command(&["crash", "archive", &report.crash_id])
                .await
            {
                warn!("failed to archive crash {}: {}", report.crash_id, e);
            }
        }
        Ok(())
    }

    /// Numeric id of a pool, from `osd pool get <pool> all`.
    pub async fn pool_id(&self, pool: &str) -> Result<i64> {
        let out = self
            .mon_command_json(&["osd", "pool", "get", pool, "all"])
            .await?;
        #[derive(Deserialize)]
        struct PoolReply {
            pool_id: i64,
        }
        let reply: PoolReply = serde_json::from_str(out.trim())?;
        Ok(reply.pool_id)
    }
}
