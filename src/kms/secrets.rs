//! Kubernetes Secret KMS (default provider)
//!
//! Stores each key-encryption-key as an opaque secret in the cluster
//! namespace. No connection details are required.

use crate::error::{Error, Result};
use crate::kms::Kms;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use std::collections::BTreeMap;
use tracing::debug;

const SECRET_DATA_KEY: &str = "dmcrypt-key";

pub struct SecretsKms {
    client: kube::Client,
    namespace: String,
}

impl SecretsKms {
    pub fn new(client: kube::Client, namespace: String) -> Self {
        Self { client, namespace }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secret_name(key: &str) -> String {
        format!("{}-block-dmcrypt", key.to_lowercase())
    }

    fn render(key: &str, value: &str) -> Secret {
        let mut data = BTreeMap::new();
        data.insert(
            SECRET_DATA_KEY.to_string(),
            ByteString(value.as_bytes().to_vec()),
        );
        Secret {
            metadata: ObjectMeta {
                name: Some(Self::secret_name(key)),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Kms for SecretsKms {
    fn provider_name(&self) -> &'static str {
        crate::kms::PROVIDER_SECRETS
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let secret = Self::render(key, value);
        match self.api().create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => self.update(key, value).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.api().get_opt(&Self::secret_name(key)).await? {
            Some(secret) => {
                let value = secret
                    .data
                    .and_then(|mut d| d.remove(SECRET_DATA_KEY))
                    .map(|b| String::from_utf8_lossy(&b.0).to_string())
                    .ok_or_else(|| Error::Kms {
                        provider: self.provider_name().to_string(),
                        reason: format!("secret for {key} has no key material"),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let name = Self::secret_name(key);
        match self.api().delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("secret {} already gone", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, key: &str, value: &str) -> Result<()> {
        let secret = Self::render(key, value);
        self.api()
            .patch(
                &Self::secret_name(key),
                &PatchParams::default(),
                &Patch::Merge(&secret),
            )
            .await?;
        Ok(())
    }
}
