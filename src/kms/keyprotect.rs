//! IBM Key Protect KMS
//!
//! Keys are stored as extractable standard keys named by PVC. Mandatory
//! connection details: `IBM_KP_SERVICE_INSTANCE_ID` and the service API key
//! (from the token secret or `IBM_KP_SERVICE_API_KEY`). The API key is
//! exchanged for an IAM bearer token on each request.

use crate::error::{Error, Result};
use crate::kms::{Kms, KmsConfig, PROVIDER_KEY_PROTECT};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://us-south.kms.cloud.ibm.com";
const DEFAULT_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";

#[derive(Debug)]
pub struct KeyProtectKms {
    http: reqwest::Client,
    base_url: String,
    token_url: String,
    instance_id: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct IamTokenReply {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct KeyList {
    #[serde(default)]
    resources: Vec<KeyResource>,
}

#[derive(Debug, Deserialize)]
struct KeyResource {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    payload: Option<String>,
}

impl KeyProtectKms {
    pub fn new(config: &KmsConfig, token: Option<&str>) -> Result<Self> {
        let instance_id = config.required_detail(PROVIDER_KEY_PROTECT, "IBM_KP_SERVICE_INSTANCE_ID")?;
        let api_key = token
            .map(str::to_string)
            .or_else(|| config.detail("IBM_KP_SERVICE_API_KEY").map(str::to_string))
            .ok_or(Error::KmsMissingDetail {
                provider: PROVIDER_KEY_PROTECT.to_string(),
                detail: "IBM_KP_SERVICE_API_KEY".to_string(),
            })?;

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config
                .detail("IBM_KP_BASE_URL")
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            token_url: config
                .detail("IBM_KP_TOKEN_URL")
                .unwrap_or(DEFAULT_TOKEN_URL)
                .to_string(),
            instance_id,
            api_key,
        })
    }

    fn error(&self, reason: impl std::fmt::Display) -> Error {
        Error::Kms {
            provider: PROVIDER_KEY_PROTECT.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn bearer_token(&self) -> Result<String> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("IAM token exchange returned {}", resp.status())));
        }
        let reply: IamTokenReply = resp.json().await?;
        Ok(reply.access_token)
    }

    async fn find_key(&self, name: &str) -> Result<Option<String>> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .get(format!("{}/api/v2/keys", self.base_url))
            .bearer_auth(&token)
            .header("Bluemix-Instance", &self.instance_id)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("key list returned {}", resp.status())));
        }
        let list: KeyList = resp.json().await?;
        Ok(list
            .resources
            .into_iter()
            .find(|k| k.name == name)
            .map(|k| k.id))
    }
}

#[async_trait]
impl Kms for KeyProtectKms {
    fn provider_name(&self) -> &'static str {
        PROVIDER_KEY_PROTECT
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let token = self.bearer_token().await?;
        let payload = base64::engine::general_purpose::STANDARD.encode(value.as_bytes());
        let body = json!({
            "metadata": {"collectionType": "application/vnd.ibm.kms.key+json", "collectionTotal": 1},
            "resources": [{
                "type": "application/vnd.ibm.kms.key+json",
                "name": key,
                "extractable": true,
                "payload": payload,
            }]
        });

        let resp = self
            .http
            .post(format!("{}/api/v2/keys", self.base_url))
            .bearer_auth(&token)
            .header("Bluemix-Instance", &self.instance_id)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("put {key} returned {}", resp.status())));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(id) = self.find_key(key).await? else {
            return Ok(None);
        };
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .get(format!("{}/api/v2/keys/{id}", self.base_url))
            .bearer_auth(&token)
            .header("Bluemix-Instance", &self.instance_id)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("get {key} returned {}", resp.status())));
        }
        let list: KeyList = resp.json().await?;
        let payload = list
            .resources
            .into_iter()
            .next()
            .and_then(|k| k.payload)
            .ok_or_else(|| self.error(format!("key {key} has no payload")))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload.as_bytes())
            .map_err(|e| self.error(format!("corrupt payload for {key}: {e}")))?;
        Ok(Some(String::from_utf8_lossy(&decoded).to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let Some(id) = self.find_key(key).await? else {
            return Ok(());
        };
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .delete(format!("{}/api/v2/keys/{id}?force=true", self.base_url))
            .bearer_auth(&token)
            .header("Bluemix-Instance", &self.instance_id)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.error(format!("delete {key} returned {}", resp.status())));
        }
        Ok(())
    }

    /// Key Protect keys are immutable; update is delete-then-create.
    async fn update(&self, key: &str, value: &str) -> Result<()> {
        self.delete(key).await?;
        self.put(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_mandatory_details() {
        let empty = KmsConfig::default();
        let err = KeyProtectKms::new(&empty, Some("apikey")).unwrap_err();
        assert!(matches!(
            err,
            Error::KmsMissingDetail { detail, .. } if detail == "IBM_KP_SERVICE_INSTANCE_ID"
        ));

        let mut details = BTreeMap::new();
        details.insert("IBM_KP_SERVICE_INSTANCE_ID".to_string(), "inst-1".to_string());
        let config = KmsConfig {
            connection_details: details,
            token_secret_name: None,
        };
        let err = KeyProtectKms::new(&config, None).unwrap_err();
        assert!(matches!(
            err,
            Error::KmsMissingDetail { detail, .. } if detail == "IBM_KP_SERVICE_API_KEY"
        ));
        assert!(KeyProtectKms::new(&config, Some("apikey")).is_ok());
    }

    #[test]
    fn test_default_endpoints() {
        let mut details = BTreeMap::new();
        details.insert("IBM_KP_SERVICE_INSTANCE_ID".to_string(), "inst-1".to_string());
        let config = KmsConfig {
            connection_details: details,
            token_secret_name: None,
        };
        let kms = KeyProtectKms::new(&config, Some("apikey")).unwrap();
        assert_eq!(kms.base_url, DEFAULT_BASE_URL);
        assert_eq!(kms.token_url, DEFAULT_TOKEN_URL);
    }
}
