//! Peer Pool ID Mapper
//!
//! For mirror-enabled pools, discovers the remote cluster's pool id through
//! a short-lived authenticated session against the peer's monitors and
//! publishes the aggregated `local <-> remote` cluster-and-pool id map for
//! client tooling.

use crate::ceph::client::MonClient;
use crate::error::{Error, Result};
use crate::exec::Executor;
use base64::Engine;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// ConfigMap name holding the aggregated mapping.
pub const MAPPING_CONFIGMAP_NAME: &str = "rbd-csi-mapping-config";

/// ConfigMap key the mapping is published under.
pub const MAPPING_CONFIGMAP_KEY: &str = "csi-mapping-config-json";

// =============================================================================
// Peer Token
// =============================================================================

/// Decoded mirror-peer bootstrap token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerToken {
    pub fsid: String,
    pub client_id: String,
    pub key: String,
    pub mon_host: String,
    #[serde(default)]
    pub namespace: String,
}

/// Decode the base64-encoded JSON peer token. Malformed input is a
/// validation failure, never retried.
pub fn decode_peer_token(encoded: &str) -> Result<PeerToken> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| Error::PeerToken(format!("invalid base64: {e}")))?;
    let token: PeerToken =
        serde_json::from_slice(&raw).map_err(|e| Error::PeerToken(format!("invalid JSON: {e}")))?;
    if token.fsid.is_empty() || token.mon_host.is_empty() {
        return Err(Error::PeerToken("token missing fsid or mon_host".into()));
    }
    Ok(token)
}

// =============================================================================
// ID Mappings
// =============================================================================

/// Pool id pairs for one cluster pair, keyed by remote pool id so the
/// published ordering is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdMapping {
    #[serde(rename = "ClusterIDMapping")]
    pub cluster_id_mapping: BTreeMap<String, String>,
    #[serde(rename = "RBDPoolIDMapping")]
    pub rbd_pool_id_mapping: Vec<BTreeMap<String, String>>,
}

/// The full published mapping set, one entry per cluster pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdMappings(pub Vec<PeerIdMapping>);

impl PeerIdMappings {
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }

    fn entry_mut(&mut self, remote_ns: &str, local_ns: &str) -> &mut PeerIdMapping {
        let position = self.0.iter().position(|m| {
            m.cluster_id_mapping.get(remote_ns).map(String::as_str) == Some(local_ns)
        });
        match position {
            Some(i) => &mut self.0[i],
            None => {
                let mut mapping = PeerIdMapping::default();
                mapping
                    .cluster_id_mapping
                    .insert(remote_ns.to_string(), local_ns.to_string());
                self.0.push(mapping);
                let last = self.0.len() - 1;
                &mut self.0[last]
            }
        }
    }

    /// Record a pool id pair for a cluster pair. An unknown remote pool id
    /// is appended; a known one has its local id overwritten.
    pub fn add_pool_mapping(
        &mut self,
        remote_ns: &str,
        local_ns: &str,
        remote_pool_id: i64,
        local_pool_id: i64,
    ) {
        let entry = self.entry_mut(remote_ns, local_ns);
        let remote_key = remote_pool_id.to_string();
        let local_value = local_pool_id.to_string();

        for pair in entry.rbd_pool_id_mapping.iter_mut() {
            if pair.contains_key(&remote_key) {
                pair.insert(remote_key, local_value);
                return;
            }
        }

        let mut pair = BTreeMap::new();
        pair.insert(remote_key, local_value);
        entry.rbd_pool_id_mapping.push(pair);
        // Ordering is deterministic by remote pool id, compared numerically
        // so id 10 sorts after id 2.
        let sort_key = |pair: &BTreeMap<String, String>| {
            let key = pair.keys().next().cloned().unwrap_or_default();
            (key.parse::<i64>().ok(), key)
        };
        entry
            .rbd_pool_id_mapping
            .sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Mapper
// =============================================================================

pub struct PeerPoolMapper {
    local_client: Arc<MonClient>,
    executor: Arc<dyn Executor>,
    kube: kube::Client,
    namespace: String,
}

impl PeerPoolMapper {
    pub fn new(
        local_client: Arc<MonClient>,
        executor: Arc<dyn Executor>,
        kube: kube::Client,
        namespace: String,
    ) -> Self {
        Self {
            local_client,
            executor,
            kube,
            namespace,
        }
    }

    /// Resolve the pool's id on the remote cluster using the peer token's
    /// credentials, then merge the pair into the published mapping.
    pub async fn map_pool_peer(
        &self,
        pool: &str,
        encoded_token: &str,
        mappings: &mut PeerIdMappings,
    ) -> Result<()> {
        let token = decode_peer_token(encoded_token)?;
        let remote_pool_id = self.remote_pool_id(pool, &token).await?;
        let local_pool_id = self.local_client.pool_id(pool).await?;

        mappings.add_pool_mapping(
            &token.namespace,
            &self.namespace,
            remote_pool_id,
            local_pool_id,
        );
        info!(
            "mapped pool {} local id {} to remote id {} (peer {})",
            pool, local_pool_id, remote_pool_id, token.namespace
        );
        Ok(())
    }

    /// Query `osd pool get <pool> all` against the peer's monitors with a
    /// throwaway keyring and empty config file.
    async fn remote_pool_id(&self, pool: &str, token: &PeerToken) -> Result<i64> {
        let scratch = std::env::temp_dir().join(format!("peer-session-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;

        let result = async {
            let keyring_path = scratch.join("keyring");
            let conf_path = scratch.join("ceph.conf");
            let entity = format!("client.{}", token.client_id);
            tokio::fs::write(
                &keyring_path,
                format!("[{entity}]\n\tkey = {}\n", token.key),
            )
            .await?;
            tokio::fs::write(&conf_path, "").await?;

            let args: Vec<String> = vec![
                "osd".into(),
                "pool".into(),
                "get".into(),
                pool.into(),
                "all".into(),
                "--format".into(),
                "json".into(),
                format!("--fsid={}", token.fsid),
                format!("--mon-host={}", token.mon_host),
                format!("--keyring={}", keyring_path.display()),
                format!("--conf={}", conf_path.display()),
                format!("--name={entity}"),
            ];
            let out = self.executor.execute("ceph", &args).await?;

            #[derive(Deserialize)]
            struct PoolReply {
                pool_id: i64,
            }
            let reply: PoolReply = serde_json::from_str(out.trim())?;
            Ok::<i64, Error>(reply.pool_id)
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!("failed to clean peer session scratch: {}", e);
        }
        result
    }

    /// Publish the aggregated mapping as a config map. Applying the same
    /// mapping twice yields a byte-identical payload.
    pub async fn publish(&self, mappings: &PeerIdMappings) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.kube.clone(), &self.namespace);
        let mut data = BTreeMap::new();
        data.insert(MAPPING_CONFIGMAP_KEY.to_string(), mappings.to_json()?);

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(MAPPING_CONFIGMAP_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &cm).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                api.patch(
                    MAPPING_CONFIGMAP_NAME,
                    &PatchParams::default(),
                    &Patch::Merge(&cm),
                )
                .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_JSON: &str = r#"{"fsid":"9f52f713-9428-4a44-bd7a-b1e5a0e3a0e9","client_id":"rbd-mirror-peer","key":"AQARzpZhAAAAABAA","mon_host":"[v2:192.168.1.3:6820,v1:192.168.1.3:6821]","namespace":"peer1"}"#;

    fn encode(json: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(json.as_bytes())
    }

    #[test]
    fn test_decode_peer_token() {
        let token = decode_peer_token(&encode(TOKEN_JSON)).unwrap();
        assert_eq!(token.namespace, "peer1");
        assert_eq!(token.client_id, "rbd-mirror-peer");
        assert_eq!(token.fsid, "9f52f713-9428-4a44-bd7a-b1e5a0e3a0e9");
    }

    #[test]
    fn test_invalid_base64_is_validation_error() {
        let err = decode_peer_token("not-base64!!!").unwrap_err();
        assert!(matches!(err, Error::PeerToken(_)));
    }

    #[test]
    fn test_token_missing_fields_rejected() {
        let err = decode_peer_token(&encode(r#"{"fsid":"","client_id":"c","key":"k","mon_host":""}"#))
            .unwrap_err();
        assert!(matches!(err, Error::PeerToken(_)));
    }

    #[test]
    fn test_pool_mapping_add_and_overwrite() {
        let mut mappings = PeerIdMappings::default();
        mappings.add_pool_mapping("peer1", "local", 3, 7);
        mappings.add_pool_mapping("peer1", "local", 1, 5);

        let entry = &mappings.0[0];
        assert_eq!(entry.cluster_id_mapping["peer1"], "local");
        // Sorted by remote pool id.
        assert_eq!(entry.rbd_pool_id_mapping[0]["1"], "5");
        assert_eq!(entry.rbd_pool_id_mapping[1]["3"], "7");

        // Known remote id: local overwritten in place.
        mappings.add_pool_mapping("peer1", "local", 3, 9);
        assert_eq!(mappings.0[0].rbd_pool_id_mapping.len(), 2);
        assert_eq!(mappings.0[0].rbd_pool_id_mapping[1]["3"], "9");
    }

    #[test]
    fn test_pool_mapping_sorts_numerically() {
        let mut mappings = PeerIdMappings::default();
        mappings.add_pool_mapping("peer1", "local", 10, 1);
        mappings.add_pool_mapping("peer1", "local", 2, 1);

        let entry = &mappings.0[0];
        assert!(entry.rbd_pool_id_mapping[0].contains_key("2"));
        assert!(entry.rbd_pool_id_mapping[1].contains_key("10"));
    }

    #[test]
    fn test_separate_cluster_pairs() {
        let mut mappings = PeerIdMappings::default();
        mappings.add_pool_mapping("peer1", "local", 1, 1);
        mappings.add_pool_mapping("peer2", "local", 1, 2);
        assert_eq!(mappings.0.len(), 2);
    }

    #[test]
    fn test_publish_payload_is_idempotent() {
        let mut a = PeerIdMappings::default();
        a.add_pool_mapping("peer1", "local", 3, 7);
        a.add_pool_mapping("peer1", "local", 1, 5);
        let first = a.to_json().unwrap();

        // Same pairs applied again, in a different order.
        a.add_pool_mapping("peer1", "local", 1, 5);
        a.add_pool_mapping("peer1", "local", 3, 7);
        assert_eq!(a.to_json().unwrap(), first);
    }

    #[test]
    fn test_round_trip_through_configmap_payload() {
        let mut mappings = PeerIdMappings::default();
        mappings.add_pool_mapping("peer1", "local", 3, 7);
        let json = mappings.to_json().unwrap();

        let parsed = PeerIdMappings::parse(&json).unwrap();
        assert_eq!(parsed, mappings);
        assert_eq!(PeerIdMappings::parse("").unwrap(), PeerIdMappings::default());
    }
}
