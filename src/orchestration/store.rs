//! Orchestration State Store
//!
//! A small key/value overlay over the control plane used to record
//! orchestration progress, trigger keys, heartbeats, and the leader lease.
//! All durable orchestrator state lives here or on the storage daemons; the
//! process itself persists nothing.
//!
//! Two implementations are provided: an in-memory store for tests and a
//! ConfigMap-backed store for production. Mutations are either
//! compare-and-swap or create-if-absent; plain `put` writes (status updates)
//! are last-writer-wins.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

// =============================================================================
// Key Layout
// =============================================================================

/// Root prefix for orchestrator-owned keys.
pub const STORE_ROOT: &str = "/orchestrator";

/// Per-node generic progress key: `/<cluster>/_notify/<node-id>/status`.
pub fn node_status_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/_notify/{node_id}/status")
}

/// Per-node per-agent status key: `/<cluster>/_notify/<node-id>/<service>/status`.
pub fn agent_status_key(cluster: &str, node_id: &str, service: &str) -> String {
    format!("/{cluster}/_notify/{node_id}/{service}/status")
}

/// Node heartbeat key, freshness derived from remaining TTL.
pub fn heartbeat_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/discovered/nodes/{node_id}/heartbeat")
}

/// Set by external actors to force hardware rediscovery; deleted by the
/// observer after processing.
pub fn hardware_detection_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/discovered/nodes/{node_id}/trigger-hardware-detection")
}

/// Per-node discovered configuration (JSON-encoded [`NodeConfig`]).
///
/// [`NodeConfig`]: crate::inventory::node::NodeConfig
pub fn node_config_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/discovered/nodes/{node_id}/config")
}

/// Leader lease key: `/<root>/leader/lease/<name>`.
pub fn lease_key(name: &str) -> String {
    format!("{STORE_ROOT}/leader/lease/{name}")
}

/// Per-node persisted partition scheme key.
pub fn scheme_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/osd/scheme/{node_id}")
}

/// Per-node provisioning phase key.
pub fn provisioning_phase_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/osd/phase/{node_id}")
}

/// Per-node directory-backed OSD map key.
pub fn dir_map_key(cluster: &str, node_id: &str) -> String {
    format!("/{cluster}/osd/dirmap/{node_id}")
}

/// Per-node applied OSD records (id -> disk uuid).
pub fn applied_osd_key(cluster: &str, node_id: &str, osd_id: i32) -> String {
    format!("/{cluster}/osd/applied/{node_id}/{osd_id}")
}

/// Backed-up OSD state file key.
pub fn osd_backup_key(cluster: &str, node_id: &str, osd_id: i32, file: &str) -> String {
    format!("/{cluster}/osd/backup/{node_id}/{osd_id}/{file}")
}

// =============================================================================
// KV Value
// =============================================================================

/// A value read from the store together with its modified index. The index
/// is the CAS token: every mutation of a key strictly increases it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvValue {
    pub value: String,
    pub modified_index: u64,
}

// =============================================================================
// KvStore Trait
// =============================================================================

/// Read/write interface over the control-plane KV overlay.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the current value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<KvValue>>;

    /// Unconditional write (last-writer-wins).
    async fn put(&self, key: &str, value: &str) -> Result<KvValue>;

    /// Unconditional write with a TTL.
    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<KvValue>;

    /// Create-if-absent. Returns `None` when another writer holds the key;
    /// a lost race is not an error.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<Option<KvValue>>;

    /// Compare-and-swap conditioned on the current modified index. A race is
    /// authoritative and yields [`Error::CompareFailed`].
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_index: u64,
        ttl: Option<Duration>,
    ) -> Result<KvValue>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key under a prefix.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// List all live keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, KvValue)>>;

    /// Block until the key's modified index exceeds `after_index`, returning
    /// the new value. Returns `None` on timeout. May fail with
    /// [`Error::IndexReset`] when the store has garbage-collected the index,
    /// in which case the caller must refresh with a plain `get`.
    async fn watch(
        &self,
        key: &str,
        after_index: u64,
        timeout: Duration,
    ) -> Result<Option<KvValue>>;
}

// =============================================================================
// Memory Store
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    modified_index: u64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

/// In-memory store with TTL and watch support. Used by tests and by the
/// standalone mode of the binary.
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
    index: Mutex<u64>,
    changes: broadcast::Sender<String>,
    /// Indices older than this are treated as garbage-collected; watchers
    /// asking for them observe an index reset. Tests use this to exercise
    /// the watcher recovery path.
    min_watch_index: Mutex<u64>,
}

impl MemoryKvStore {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            index: Mutex::new(0),
            changes: tx,
            min_watch_index: Mutex::new(0),
        })
    }

    fn next_index(&self) -> u64 {
        let mut idx = self.index.lock();
        *idx += 1;
        *idx
    }

    fn write(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvValue {
        let index = self.next_index();
        let entry = MemoryEntry {
            value: value.to_string(),
            modified_index: index,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.lock().insert(key.to_string(), entry);
        let _ = self.changes.send(key.to_string());
        KvValue {
            value: value.to_string(),
            modified_index: index,
        }
    }

    fn live(&self, key: &str) -> Option<KvValue> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.expired() => {
                entries.remove(key);
                None
            }
            Some(e) => Some(KvValue {
                value: e.value.clone(),
                modified_index: e.modified_index,
            }),
            None => None,
        }
    }

    /// Simulate backing-store index garbage collection (tests).
    pub fn reset_watch_floor(&self, min_index: u64) {
        *self.min_watch_index.lock() = min_index;
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvValue>> {
        Ok(self.live(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<KvValue> {
        Ok(self.write(key, value, None))
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<KvValue> {
        Ok(self.write(key, value, Some(ttl)))
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<KvValue>> {
        if self.live(key).is_some() {
            return Ok(None);
        }
        Ok(Some(self.write(key, value, ttl)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_index: u64,
        ttl: Option<Duration>,
    ) -> Result<KvValue> {
        let current = self.live(key);
        match current {
            Some(v) if v.modified_index == prev_index => Ok(self.write(key, value, ttl)),
            _ => Err(Error::CompareFailed {
                key: key.to_string(),
                expected: prev_index,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.entries.lock().remove(key).is_some() {
            let _ = self.changes.send(key.to_string());
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let removed: Vec<String> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            for k in &keys {
                entries.remove(k);
            }
            keys
        };
        for k in removed {
            let _ = self.changes.send(k);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, KvValue)>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired())
            .map(|(k, e)| {
                (
                    k.clone(),
                    KvValue {
                        value: e.value.clone(),
                        modified_index: e.modified_index,
                    },
                )
            })
            .collect())
    }

    async fn watch(
        &self,
        key: &str,
        after_index: u64,
        timeout: Duration,
    ) -> Result<Option<KvValue>> {
        if after_index < *self.min_watch_index.lock() {
            return Err(Error::IndexReset {
                key: key.to_string(),
            });
        }

        let deadline = Instant::now() + timeout;
        let mut rx = self.changes.subscribe();
        loop {
            if let Some(v) = self.live(key) {
                if v.modified_index > after_index {
                    return Ok(Some(v));
                }
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Ok(None),
            };

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(changed)) if changed == key => continue,
                Ok(Ok(_)) => continue,
                // Lagged receivers re-check state and continue
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }
}

// =============================================================================
// ConfigMap Store
// =============================================================================

/// Serialized form of an entry inside the backing ConfigMap.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigMapEntry {
    value: String,
    modified_index: u64,
    /// Epoch milliseconds; TTL is enforced client-side on read since config
    /// maps have no native expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl ConfigMapEntry {
    fn expired(&self) -> bool {
        self.expires_at_ms
            .map(|at| chrono::Utc::now().timestamp_millis() >= at)
            .unwrap_or(false)
    }
}

const INDEX_ANNOTATION: &str = "orchestrator.billyronks.io/modified-index";

/// Store backed by a single namespaced ConfigMap. Keys are sanitized into
/// ConfigMap data keys; the global modified index rides in an annotation and
/// optimistic concurrency uses the ConfigMap resourceVersion.
pub struct ConfigMapKvStore {
    api: kube::Api<k8s_openapi::api::core::v1::ConfigMap>,
    name: String,
    poll_interval: Duration,
}

impl ConfigMapKvStore {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: kube::Api::namespaced(client, namespace),
            name: name.to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// ConfigMap data keys only allow `[-._a-zA-Z0-9]`.
    fn sanitize(key: &str) -> String {
        key.trim_start_matches('/').replace('/', ".")
    }

    async fn load(
        &self,
    ) -> Result<(
        BTreeMap<String, ConfigMapEntry>,
        u64,
        Option<String>,
    )> {
        match self.api.get_opt(&self.name).await? {
            Some(cm) => {
                let index = cm
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(INDEX_ANNOTATION))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let mut entries = BTreeMap::new();
                for (k, v) in cm.data.unwrap_or_default() {
                    match serde_json::from_str::<ConfigMapEntry>(&v) {
                        Ok(entry) => {
                            entries.insert(k, entry);
                        }
                        Err(e) => debug!("skipping malformed store entry {k}: {e}"),
                    }
                }
                Ok((entries, index, cm.metadata.resource_version))
            }
            None => Ok((BTreeMap::new(), 0, None)),
        }
    }

    async fn save(
        &self,
        entries: &BTreeMap<String, ConfigMapEntry>,
        index: u64,
        resource_version: Option<String>,
    ) -> Result<()> {
        use k8s_openapi::api::core::v1::ConfigMap;
        use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};

        let data: BTreeMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::to_string(v).unwrap_or_default()))
            .collect();

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                annotations: Some(BTreeMap::from([(
                    INDEX_ANNOTATION.to_string(),
                    index.to_string(),
                )])),
                resource_version: resource_version.clone(),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        if resource_version.is_none() {
            self.api
                .create(&PostParams::default(), &cm)
                .await
                .map_err(|e| Error::Store(format!("failed to create store config map: {e}")))?;
        } else {
            self.api
                .patch(
                    &self.name,
                    &PatchParams::default(),
                    &Patch::Merge(&cm),
                )
                .await
                .map_err(|e| Error::Store(format!("failed to update store config map: {e}")))?;
        }
        Ok(())
    }

    async fn mutate<F>(&self, f: F) -> Result<KvValue>
    where
        F: Fn(&mut BTreeMap<String, ConfigMapEntry>, u64) -> Result<KvValue>,
    {
        // Retry the read-modify-write on resourceVersion conflicts.
        for _ in 0..5 {
            let (mut entries, index, rv) = self.load().await?;
            let next = index + 1;
            let result = f(&mut entries, next)?;
            match self.save(&entries, next, rv).await {
                Ok(()) => return Ok(result),
                Err(Error::Store(msg)) if msg.contains("Conflict") => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Store("store config map contention".into()))
    }
}

#[async_trait]
impl KvStore for ConfigMapKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvValue>> {
        let (entries, _, _) = self.load().await?;
        Ok(entries
            .get(&Self::sanitize(key))
            .filter(|e| !e.expired())
            .map(|e| KvValue {
                value: e.value.clone(),
                modified_index: e.modified_index,
            }))
    }

    async fn put(&self, key: &str, value: &str) -> Result<KvValue> {
        let key = Self::sanitize(key);
        let value = value.to_string();
        self.mutate(move |entries, index| {
            entries.insert(
                key.clone(),
                ConfigMapEntry {
                    value: value.clone(),
                    modified_index: index,
                    expires_at_ms: None,
                },
            );
            Ok(KvValue {
                value: value.clone(),
                modified_index: index,
            })
        })
        .await
    }

    async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<KvValue> {
        let key = Self::sanitize(key);
        let value = value.to_string();
        let expires = chrono::Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        self.mutate(move |entries, index| {
            entries.insert(
                key.clone(),
                ConfigMapEntry {
                    value: value.clone(),
                    modified_index: index,
                    expires_at_ms: Some(expires),
                },
            );
            Ok(KvValue {
                value: value.clone(),
                modified_index: index,
            })
        })
        .await
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<KvValue>> {
        let skey = Self::sanitize(key);
        let value = value.to_string();
        let expires = ttl.map(|t| chrono::Utc::now().timestamp_millis() + t.as_millis() as i64);
        let result = self
            .mutate(move |entries, index| {
                if entries.get(&skey).map(|e| !e.expired()).unwrap_or(false) {
                    return Err(Error::CompareFailed {
                        key: skey.clone(),
                        expected: 0,
                    });
                }
                entries.insert(
                    skey.clone(),
                    ConfigMapEntry {
                        value: value.clone(),
                        modified_index: index,
                        expires_at_ms: expires,
                    },
                );
                Ok(KvValue {
                    value: value.clone(),
                    modified_index: index,
                })
            })
            .await;
        match result {
            Ok(v) => Ok(Some(v)),
            Err(Error::CompareFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        prev_index: u64,
        ttl: Option<Duration>,
    ) -> Result<KvValue> {
        let skey = Self::sanitize(key);
        let value = value.to_string();
        let expires = ttl.map(|t| chrono::Utc::now().timestamp_millis() + t.as_millis() as i64);
        self.mutate(move |entries, index| {
            let current = entries.get(&skey).filter(|e| !e.expired());
            match current {
                Some(e) if e.modified_index == prev_index => {
                    entries.insert(
                        skey.clone(),
                        ConfigMapEntry {
                            value: value.clone(),
                            modified_index: index,
                            expires_at_ms: expires,
                        },
                    );
                    Ok(KvValue {
                        value: value.clone(),
                        modified_index: index,
                    })
                }
                _ => Err(Error::CompareFailed {
                    key: skey.clone(),
                    expected: prev_index,
                }),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let skey = Self::sanitize(key);
        self.mutate(move |entries, index| {
            entries.remove(&skey);
            Ok(KvValue {
                value: String::new(),
                modified_index: index,
            })
        })
        .await
        .map(|_| ())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let sprefix = Self::sanitize(prefix);
        self.mutate(move |entries, index| {
            entries.retain(|k, _| !k.starts_with(&sprefix));
            Ok(KvValue {
                value: String::new(),
                modified_index: index,
            })
        })
        .await
        .map(|_| ())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, KvValue)>> {
        let sprefix = Self::sanitize(prefix);
        let (entries, _, _) = self.load().await?;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(&sprefix) && !e.expired())
            .map(|(k, e)| {
                (
                    k.clone(),
                    KvValue {
                        value: e.value.clone(),
                        modified_index: e.modified_index,
                    },
                )
            })
            .collect())
    }

    async fn watch(
        &self,
        key: &str,
        after_index: u64,
        timeout: Duration,
    ) -> Result<Option<KvValue>> {
        // The config map API has no per-key watch; poll at a short interval.
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = self.get(key).await? {
                if v.modified_index > after_index {
                    return Ok(Some(v));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
