//! Key Management Service Adapters
//!
//! A provider-agnostic secret store for per-OSD key-encryption-keys. The
//! provider is chosen by the `KMS_PROVIDER` connection detail; each adapter
//! validates its mandatory connection details on construction and rejects
//! with a named error when one is missing.

pub mod azure;
pub mod keyprotect;
pub mod kmip;
pub mod rotation;
pub mod secrets;
pub mod vault;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use rotation::rotate_key;

/// Connection detail selecting the provider.
pub const PROVIDER_KEY: &str = "KMS_PROVIDER";

pub const PROVIDER_SECRETS: &str = "secrets";
pub const PROVIDER_VAULT: &str = "vault";
pub const PROVIDER_KEY_PROTECT: &str = "ibmkeyprotect";
pub const PROVIDER_AZURE: &str = "azure-kv";
pub const PROVIDER_KMIP: &str = "kmip";

// =============================================================================
// KMS Trait
// =============================================================================

/// Put/get/delete/update of opaque key material, keyed by PVC name.
#[async_trait]
pub trait Kms: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Replace existing key material. Providers whose `put` upserts reuse it.
    async fn update(&self, key: &str, value: &str) -> Result<()> {
        self.put(key, value).await
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// The `security.kms` section of the cluster declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsConfig {
    #[serde(default)]
    pub connection_details: BTreeMap<String, String>,
    /// Name of the secret carrying the provider's auth token.
    #[serde(default)]
    pub token_secret_name: Option<String>,
}

impl KmsConfig {
    pub fn provider(&self) -> &str {
        self.connection_details
            .get(PROVIDER_KEY)
            .map(String::as_str)
            .unwrap_or(PROVIDER_SECRETS)
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.connection_details.get(key).map(String::as_str)
    }

    /// Fetch a mandatory connection detail, naming it in the error.
    pub fn required_detail(&self, provider: &'static str, key: &str) -> Result<String> {
        match self.detail(key) {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => Err(Error::KmsMissingDetail {
                provider: provider.to_string(),
                detail: key.to_string(),
            }),
        }
    }
}

// =============================================================================
// Provider Selection
// =============================================================================

/// Construct the configured KMS adapter. Auth tokens resolved from the
/// token secret are passed in by the caller, which owns secret access.
pub fn new_kms(
    config: &KmsConfig,
    kube_client: kube::Client,
    namespace: &str,
    token: Option<&str>,
) -> Result<Arc<dyn Kms>> {
    match config.provider() {
        PROVIDER_SECRETS => Ok(Arc::new(secrets::SecretsKms::new(
            kube_client,
            namespace.to_string(),
        ))),
        PROVIDER_VAULT => Ok(Arc::new(vault::VaultKms::new(config, token)?)),
        PROVIDER_KEY_PROTECT => Ok(Arc::new(keyprotect::KeyProtectKms::new(config, token)?)),
        PROVIDER_AZURE => Ok(Arc::new(azure::AzureKms::new(config)?)),
        PROVIDER_KMIP => Ok(Arc::new(kmip::KmipKms::new(config)?)),
        other => Err(Error::Validation(format!("unknown KMS provider {other:?}"))),
    }
}

/// In-memory KMS for exercising consumers without a real provider.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MemoryKms {
        entries: Mutex<BTreeMap<String, String>>,
    }

    impl MemoryKms {
        pub fn with_key(key: &str, value: &str) -> Arc<Self> {
            let kms = Self::default();
            kms.entries
                .lock()
                .insert(key.to_string(), value.to_string());
            Arc::new(kms)
        }
    }

    #[async_trait]
    impl Kms for MemoryKms {
        fn provider_name(&self) -> &'static str {
            "memory"
        }

        async fn put(&self, key: &str, value: &str) -> Result<()> {
            self.entries
                .lock()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.entries.lock().get(key).cloned())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.entries.lock().remove(key);
            Ok(())
        }
    }
}
