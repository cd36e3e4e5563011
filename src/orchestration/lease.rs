//! Lease Manager
//!
//! A cluster-wide lease identifying the single active orchestrator for a
//! cluster. Lease state is a JSON value `{machine-id, version}` under a
//! well-known key with a TTL. Acquisition is create-if-absent; renewal and
//! steal are compare-and-swap on the modified index. The backing store's CAS
//! is authoritative: a lost race yields `None`, not an error.

use crate::error::{Error, Result};
use crate::orchestration::store::{lease_key, KvStore, KvValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Lease Value
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseValue {
    #[serde(rename = "machine-id")]
    machine_id: String,
    version: u32,
}

// =============================================================================
// Lease
// =============================================================================

/// A held or observed lease. Renewal replaces the local representation
/// wholesale with the store's response (new modified index, new TTL).
#[derive(Clone)]
pub struct Lease {
    store: Arc<dyn KvStore>,
    name: String,
    machine_id: String,
    version: u32,
    modified_index: u64,
    ttl: Duration,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn modified_index(&self) -> u64 {
        self.modified_index
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Renew the lease for `ttl`. Requires the modified index to still
    /// match; on success the lease's index advances to the response's.
    pub async fn renew(&mut self, ttl: Duration) -> Result<()> {
        let value = encode(&self.machine_id, self.version)?;
        let renewed = self
            .store
            .compare_and_swap(&lease_key(&self.name), &value, self.modified_index, Some(ttl))
            .await
            .map_err(|e| match e {
                Error::CompareFailed { .. } => Error::LeaseRenewal {
                    name: self.name.clone(),
                    reason: "lease was taken by another holder".into(),
                },
                other => other,
            })?;

        self.modified_index = renewed.modified_index;
        self.ttl = ttl;
        Ok(())
    }

    /// Release the lease. Only deletes the key if we still hold it.
    pub async fn release(self) -> Result<()> {
        let key = lease_key(&self.name);
        match self.store.get(&key).await? {
            Some(current) if current.modified_index == self.modified_index => {
                self.store.delete(&key).await
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Lease Manager
// =============================================================================

/// Acquires, observes, and steals leases for named clusters.
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Get the current holder of a lease, or `None` when unheld.
    pub async fn get_lease(&self, name: &str) -> Result<Option<Lease>> {
        let key = lease_key(name);
        match self.store.get(&key).await? {
            Some(v) => Ok(Some(self.from_value(name, &v)?)),
            None => Ok(None),
        }
    }

    /// Acquire the lease with a create-if-absent write. Returns `None` when
    /// another holder currently owns it; a race is not an error.
    pub async fn acquire_lease(
        &self,
        name: &str,
        machine_id: &str,
        version: u32,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let value = encode(machine_id, version)?;
        match self
            .store
            .create(&lease_key(name), &value, Some(ttl))
            .await?
        {
            Some(created) => {
                debug!(
                    "acquired lease {} for {} at index {}",
                    name, machine_id, created.modified_index
                );
                Ok(Some(Lease {
                    store: self.store.clone(),
                    name: name.to_string(),
                    machine_id: machine_id.to_string(),
                    version,
                    modified_index: created.modified_index,
                    ttl,
                }))
            }
            None => Ok(None),
        }
    }

    /// Forced acquisition conditioned on having observed the lease at
    /// `prev_index`. If the observed index no longer matches, returns `None`.
    pub async fn steal_lease(
        &self,
        name: &str,
        machine_id: &str,
        version: u32,
        ttl: Duration,
        prev_index: u64,
    ) -> Result<Option<Lease>> {
        let value = encode(machine_id, version)?;
        match self
            .store
            .compare_and_swap(&lease_key(name), &value, prev_index, Some(ttl))
            .await
        {
            Ok(stolen) => Ok(Some(Lease {
                store: self.store.clone(),
                name: name.to_string(),
                machine_id: machine_id.to_string(),
                version,
                modified_index: stolen.modified_index,
                ttl,
            })),
            Err(Error::CompareFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn from_value(&self, name: &str, v: &KvValue) -> Result<Lease> {
        let decoded: LeaseValue = serde_json::from_str(&v.value)
            .map_err(|e| Error::Store(format!("malformed lease value for {name}: {e}")))?;
        Ok(Lease {
            store: self.store.clone(),
            name: name.to_string(),
            machine_id: decoded.machine_id,
            version: decoded.version,
            modified_index: v.modified_index,
            // TTL remaining is tracked by the store; observers only need
            // identity and index.
            ttl: Duration::ZERO,
        })
    }
}

fn encode(machine_id: &str, version: u32) -> Result<String> {
    Ok(serde_json::to_string(&LeaseValue {
        machine_id: machine_id.to_string(),
        version,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::store::MemoryKvStore;

    fn manager() -> (Arc<MemoryKvStore>, LeaseManager) {
        let store = MemoryKvStore::new();
        let mgr = LeaseManager::new(store.clone());
        (store, mgr)
    }

    #[tokio::test]
    async fn test_acquire_and_get() {
        let (_, mgr) = manager();
        let lease = mgr
            .acquire_lease("ceph", "machine-a", 1, Duration::from_secs(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.machine_id(), "machine-a");

        let observed = mgr.get_lease("ceph").await.unwrap().unwrap();
        assert_eq!(observed.machine_id(), "machine-a");
        assert_eq!(observed.modified_index(), lease.modified_index());
    }

    #[tokio::test]
    async fn test_contention_yields_none() {
        let (_, mgr) = manager();
        let a = mgr
            .acquire_lease("L", "A", 1, Duration::from_secs(15))
            .await
            .unwrap();
        assert!(a.is_some());

        // B's create fails because the key exists; this is not an error.
        let b = mgr
            .acquire_lease("L", "B", 1, Duration::from_secs(15))
            .await
            .unwrap();
        assert!(b.is_none());

        let holder = mgr.get_lease("L").await.unwrap().unwrap();
        assert_eq!(holder.machine_id(), "A");
    }

    #[tokio::test]
    async fn test_expiry_allows_reacquisition() {
        let (_, mgr) = manager();
        let a = mgr
            .acquire_lease("L", "A", 1, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        let first_index = a.modified_index();

        tokio::time::sleep(Duration::from_millis(40)).await;

        // A never renewed; B's next election acquires at a higher index.
        let b = mgr
            .acquire_lease("L", "B", 1, Duration::from_secs(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.machine_id(), "B");
        assert!(b.modified_index() > first_index);
    }

    #[tokio::test]
    async fn test_renewal_monotonicity() {
        let (_, mgr) = manager();
        let mut lease = mgr
            .acquire_lease("L", "A", 1, Duration::from_secs(15))
            .await
            .unwrap()
            .unwrap();

        let mut last = lease.modified_index();
        for _ in 0..3 {
            lease.renew(Duration::from_secs(15)).await.unwrap();
            assert!(lease.modified_index() > last);
            last = lease.modified_index();
        }
    }

    #[tokio::test]
    async fn test_renewal_fails_after_steal() {
        let (_, mgr) = manager();
        let mut a = mgr
            .acquire_lease("L", "A", 1, Duration::from_secs(15))
            .await
            .unwrap()
            .unwrap();

        let stolen = mgr
            .steal_lease("L", "B", 2, Duration::from_secs(15), a.modified_index())
            .await
            .unwrap();
        assert!(stolen.is_some());

        let err = a.renew(Duration::from_secs(15)).await.unwrap_err();
        assert!(matches!(err, Error::LeaseRenewal { .. }));
    }

    #[tokio::test]
    async fn test_steal_with_stale_index_yields_none() {
        let (_, mgr) = manager();
        let lease = mgr
            .acquire_lease("L", "A", 1, Duration::from_secs(15))
            .await
            .unwrap()
            .unwrap();

        let stale = lease.modified_index() + 5;
        let stolen = mgr
            .steal_lease("L", "B", 1, Duration::from_secs(15), stale)
            .await
            .unwrap();
        assert!(stolen.is_none());
    }

    #[tokio::test]
    async fn test_release() {
        let (_, mgr) = manager();
        let lease = mgr
            .acquire_lease("L", "A", 1, Duration::from_secs(15))
            .await
            .unwrap()
            .unwrap();
        lease.release().await.unwrap();
        assert!(mgr.get_lease("L").await.unwrap().is_none());
    }
}
