//! Azure Key Vault KMS
//!
//! Keys are stored as Key Vault secrets. Mandatory connection details:
//! `AZURE_VAULT_URL`, `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, and
//! `AZURE_CLIENT_SECRET`. A bearer token is obtained via the client
//! credentials grant before each request.

use crate::error::{Error, Result};
use crate::kms::{Kms, KmsConfig, PROVIDER_AZURE};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

const API_VERSION: &str = "7.4";
const SCOPE: &str = "https://vault.azure.net/.default";

#[derive(Debug)]
pub struct AzureKms {
    http: reqwest::Client,
    vault_url: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    /// Override for the login endpoint (tests).
    token_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretReply {
    value: String,
}

impl AzureKms {
    pub fn new(config: &KmsConfig) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            vault_url: config
                .required_detail(PROVIDER_AZURE, "AZURE_VAULT_URL")?
                .trim_end_matches('/')
                .to_string(),
            tenant_id: config.required_detail(PROVIDER_AZURE, "AZURE_TENANT_ID")?,
            client_id: config.required_detail(PROVIDER_AZURE, "AZURE_CLIENT_ID")?,
            client_secret: config.required_detail(PROVIDER_AZURE, "AZURE_CLIENT_SECRET")?,
            token_endpoint: config.detail("AZURE_TOKEN_ENDPOINT").map(str::to_string),
        })
    }

    fn error(&self, reason: impl std::fmt::Display) -> Error {
        Error::Kms {
            provider: PROVIDER_AZURE.to_string(),
            reason: reason.to_string(),
        }
    }

    fn secret_url(&self, key: &str) -> String {
        format!(
            "{}/secrets/{}?api-version={}",
            self.vault_url,
            urlencoding::encode(key),
            API_VERSION
        )
    }

    async fn bearer_token(&self) -> Result<String> {
        let endpoint = match &self.token_endpoint {
            Some(e) => e.clone(),
            None => format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                self.tenant_id
            ),
        };
        let resp = self
            .http
            .post(endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", SCOPE),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("token request returned {}", resp.status())));
        }
        let reply: TokenReply = resp.json().await?;
        Ok(reply.access_token)
    }
}

#[async_trait]
impl Kms for AzureKms {
    fn provider_name(&self) -> &'static str {
        PROVIDER_AZURE
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .put(self.secret_url(key))
            .bearer_auth(token)
            .json(&json!({ "value": value }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("put {key} returned {}", resp.status())));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .get(self.secret_url(key))
            .bearer_auth(token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(self.error(format!("get {key} returned {}", resp.status())));
        }
        let reply: SecretReply = resp.json().await?;
        Ok(Some(reply.value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .delete(self.secret_url(key))
            .bearer_auth(token)
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(self.error(format!("delete {key} returned {}", resp.status())));
        }
        Ok(())
    }
}
