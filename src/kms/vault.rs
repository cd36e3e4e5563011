//! HashiCorp Vault KMS
//!
//! Uses the KV v2 HTTP API. Mandatory connection detail: `VAULT_ADDR`.
//! The auth token comes from the configured token secret, falling back to
//! the `VAULT_TOKEN` connection detail.

use crate::error::{Error, Result};
use crate::kms::{Kms, KmsConfig, PROVIDER_VAULT};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

const DATA_KEY: &str = "dmcrypt-key";
const DEFAULT_BACKEND_PATH: &str = "secret";

#[derive(Debug)]
pub struct VaultKms {
    http: reqwest::Client,
    addr: String,
    backend_path: String,
    namespace: Option<String>,
    token: String,
}

#[derive(Debug, Deserialize)]
struct KvReadReply {
    data: KvReadData,
}

#[derive(Debug, Deserialize)]
struct KvReadData {
    data: BTreeMap<String, String>,
}

impl VaultKms {
    pub fn new(config: &KmsConfig, token: Option<&str>) -> Result<Self> {
        let addr = config.required_detail(PROVIDER_VAULT, "VAULT_ADDR")?;
        let token = token
            .map(str::to_string)
            .or_else(|| config.detail("VAULT_TOKEN").map(str::to_string))
            .ok_or(Error::KmsMissingDetail {
                provider: PROVIDER_VAULT.to_string(),
                detail: "VAULT_TOKEN".to_string(),
            })?;

        Ok(Self {
            http: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_string(),
            backend_path: config
                .detail("VAULT_BACKEND_PATH")
                .unwrap_or(DEFAULT_BACKEND_PATH)
                .trim_matches('/')
                .to_string(),
            namespace: config.detail("VAULT_NAMESPACE").map(str::to_string),
            token,
        })
    }

    fn url(&self, segment: &str, key: &str) -> String {
        format!(
            "{}/v1/{}/{}/{}",
            self.addr,
            self.backend_path,
            segment,
            urlencoding::encode(key)
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("X-Vault-Token", &self.token);
        match &self.namespace {
            Some(ns) => builder.header("X-Vault-Namespace", ns),
            None => builder,
        }
    }

    fn error(&self, reason: impl std::fmt::Display) -> Error {
        Error::Kms {
            provider: PROVIDER_VAULT.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Kms for VaultKms {
    fn provider_name(&self) -> &'static str {
        PROVIDER_VAULT
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let body = json!({ "data": { DATA_KEY: value } });
        let resp = self
            .request(self.http.post(self.url("data", key)))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("put {key} returned {}", resp.status())));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .request(self.http.get(self.url("data", key)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(self.error(format!("get {key} returned {}", resp.status())));
        }

        let reply: KvReadReply = resp.json().await?;
        Ok(reply.data.data.get(DATA_KEY).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .request(self.http.delete(self.url("metadata", key)))
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(self.error(format!("delete {key} returned {}", resp.status())));
        }
        Ok(())
    }
}
