//! CephBlockPool CRD
//!
//! A declared pool: replicated or erasure-coded data protection, plus
//! optional mirroring to peer clusters.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

// =============================================================================
// CephBlockPool CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ceph.storageops.io",
    version = "v1",
    kind = "CephBlockPool",
    plural = "cephblockpools",
    shortname = "cbp",
    status = "CephBlockPoolStatus",
    printcolumn = r#"{"name": "Mirroring", "type": "string", "jsonPath": ".spec.mirroring.mode"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolSpec {
    /// Replication settings. Exactly one of `replicated` or `erasureCoded`
    /// must be set.
    #[serde(default)]
    pub replicated: Option<ReplicatedSpec>,

    #[serde(default)]
    pub erasure_coded: Option<ErasureCodedSpec>,

    #[serde(default)]
    pub mirroring: PoolMirroringSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSpec {
    /// Number of data copies.
    pub size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErasureCodedSpec {
    pub data_chunks: u32,
    pub coding_chunks: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolMirroringSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mode: MirroringMode,

    /// Secrets carrying the peer bootstrap tokens for this pool.
    #[serde(default)]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MirroringMode {
    #[default]
    Pool,
    Image,
}

impl fmt::Display for MirroringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirroringMode::Pool => write!(f, "pool"),
            MirroringMode::Image => write!(f, "image"),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PoolPhase {
    #[default]
    Pending,
    Progressing,
    Ready,
    Failure,
    Deleting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolStatus {
    #[serde(default)]
    pub phase: PoolPhase,

    #[serde(default)]
    pub message: String,

    /// Numeric pool id assigned by the mon, once created.
    #[serde(default)]
    pub pool_id: Option<i64>,
}

// =============================================================================
// Implementations
// =============================================================================

impl CephBlockPool {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn mirroring_enabled(&self) -> bool {
        self.spec.mirroring.enabled
    }

    pub fn validate(&self) -> Result<()> {
        self.spec.validate()
    }
}

impl CephBlockPoolSpec {
    pub fn validate(&self) -> Result<()> {
        match (&self.replicated, &self.erasure_coded) {
            (Some(_), Some(_)) => Err(Error::Validation(
                "pool cannot be both replicated and erasure coded".into(),
            )),
            (None, None) => Err(Error::Validation(
                "pool requires replicated or erasureCoded settings".into(),
            )),
            (Some(r), None) if r.size == 0 => {
                Err(Error::Validation("replicated size must be at least 1".into()))
            }
            (None, Some(ec)) if ec.data_chunks == 0 || ec.coding_chunks == 0 => Err(
                Error::Validation("erasure coding requires data and coding chunks".into()),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicated(size: u32) -> CephBlockPoolSpec {
        CephBlockPoolSpec {
            replicated: Some(ReplicatedSpec { size }),
            ..Default::default()
        }
    }

    #[test]
    fn test_exactly_one_protection_scheme() {
        assert!(replicated(3).validate().is_ok());
        assert!(CephBlockPoolSpec::default().validate().is_err());

        let both = CephBlockPoolSpec {
            replicated: Some(ReplicatedSpec { size: 3 }),
            erasure_coded: Some(ErasureCodedSpec {
                data_chunks: 2,
                coding_chunks: 1,
            }),
            ..Default::default()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_degenerate_settings_rejected() {
        assert!(replicated(0).validate().is_err());

        let ec = CephBlockPoolSpec {
            erasure_coded: Some(ErasureCodedSpec {
                data_chunks: 2,
                coding_chunks: 0,
            }),
            ..Default::default()
        };
        assert!(ec.validate().is_err());
    }

    #[test]
    fn test_mirroring_deserializes() {
        let yaml = r#"
replicated:
  size: 3
mirroring:
  enabled: true
  mode: image
  peers:
    - peer-secret-1
"#;
        let spec: CephBlockPoolSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(spec.mirroring.enabled);
        assert_eq!(spec.mirroring.mode, MirroringMode::Image);
        assert_eq!(spec.mirroring.peers, vec!["peer-secret-1"]);
    }
}
