//! Admission Webhook
//!
//! Validating webhook for the cluster and pool resources. The wire contract
//! is strict: only POST with a JSON content type is accepted; any other
//! method yields 405 and any other content type 400. The response is a
//! standard admission review carrying `{allowed, result: {message}}`.

use crate::crd::{CephBlockPoolSpec, CephStorageClusterSpec};
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

// =============================================================================
// Admission Review Wire Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub operation: String,
    /// The object under review, raw.
    #[serde(default)]
    pub object: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AdmissionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub message: String,
}

fn default_api_version() -> String {
    "admission.k8s.io/v1".to_string()
}

fn default_kind() -> String {
    "AdmissionReview".to_string()
}

// =============================================================================
// Validation
// =============================================================================

/// Validate the object under review. Unknown kinds are allowed through so
/// a misconfigured webhook rule never blocks unrelated resources.
pub fn review(incoming: &AdmissionReview) -> AdmissionReview {
    let Some(request) = &incoming.request else {
        return respond("", false, Some("admission review carries no request"));
    };

    let verdict = match request.kind.kind.as_str() {
        "CephStorageCluster" => validate_object::<CephStorageClusterSpec>(request),
        "CephBlockPool" => validate_object::<CephBlockPoolSpec>(request),
        other => {
            debug!("admitting unvalidated kind {}", other);
            Ok(())
        }
    };

    match verdict {
        Ok(()) => respond(&request.uid, true, None),
        Err(message) => {
            warn!(
                "denied {} {}: {}",
                request.operation, request.kind.kind, message
            );
            respond(&request.uid, false, Some(&message))
        }
    }
}

fn validate_object<T>(request: &AdmissionRequest) -> std::result::Result<(), String>
where
    T: serde::de::DeserializeOwned + Validate,
{
    let Some(object) = &request.object else {
        return Err("request carries no object".to_string());
    };
    let spec = object
        .get("spec")
        .cloned()
        .ok_or_else(|| "object carries no spec".to_string())?;
    let parsed: T = serde_json::from_value(spec).map_err(|e| format!("malformed spec: {e}"))?;
    parsed.validate().map_err(|e| e.to_string())
}

trait Validate {
    fn validate(&self) -> crate::error::Result<()>;
}

impl Validate for CephStorageClusterSpec {
    fn validate(&self) -> crate::error::Result<()> {
        CephStorageClusterSpec::validate(self)
    }
}

impl Validate for CephBlockPoolSpec {
    fn validate(&self) -> crate::error::Result<()> {
        CephBlockPoolSpec::validate(self)
    }
}

fn respond(uid: &str, allowed: bool, message: Option<&str>) -> AdmissionReview {
    AdmissionReview {
        api_version: default_api_version(),
        kind: default_kind(),
        request: None,
        response: Some(AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            result: message.map(|m| AdmissionResult {
                message: m.to_string(),
            }),
        }),
    }
}

// =============================================================================
// HTTP Surface
// =============================================================================

/// Router serving the admission endpoint at `/validate`.
pub fn router() -> Router {
    Router::new().route("/validate", any(handle))
}

async fn handle(request: Request) -> Response {
    if request.method() != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return (
            StatusCode::BAD_REQUEST,
            "content type must be application/json",
        )
            .into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), 1 << 20).await {
        Ok(b) => b,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("body: {e}")).into_response(),
    };
    let incoming: AdmissionReview = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("malformed review: {e}")).into_response()
        }
    };

    Json(review(&incoming)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    fn review_body(kind: &str, spec: Value) -> String {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "r-1",
                "operation": "CREATE",
                "kind": {"group": "ceph.storageops.io", "version": "v1", "kind": kind},
                "object": {"spec": spec}
            }
        })
        .to_string()
    }

    async fn post_json(body: String) -> (StatusCode, Value) {
        let response = router()
            .oneshot(
                axum::http::Request::post("/validate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_valid_pool_is_allowed() {
        let body = review_body(
            "CephBlockPool",
            serde_json::json!({"replicated": {"size": 3}}),
        );
        let (status, value) = post_json(body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["response"]["allowed"], true);
        assert_eq!(value["response"]["uid"], "r-1");
    }

    #[tokio::test]
    async fn test_conflicting_pool_is_denied_with_message() {
        let body = review_body(
            "CephBlockPool",
            serde_json::json!({
                "replicated": {"size": 3},
                "erasureCoded": {"dataChunks": 2, "codingChunks": 1}
            }),
        );
        let (status, value) = post_json(body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["response"]["allowed"], false);
        assert!(value["response"]["result"]["message"]
            .as_str()
            .unwrap()
            .contains("replicated"));
    }

    #[tokio::test]
    async fn test_even_mon_count_denied() {
        let body = review_body(
            "CephStorageCluster",
            serde_json::json!({"mon": {"count": 2}}),
        );
        let (_, value) = post_json(body).await;
        assert_eq!(value["response"]["allowed"], false);
    }

    #[tokio::test]
    async fn test_unnamed_device_set_denied() {
        // Admission enforces the same shape checks as reconcile.
        let body = review_body(
            "CephStorageCluster",
            serde_json::json!({
                "storage": {"storageClassDeviceSets": [{"name": "", "count": 3}]}
            }),
        );
        let (_, value) = post_json(body).await;
        assert_eq!(value["response"]["allowed"], false);
        assert!(value["response"]["result"]["message"]
            .as_str()
            .unwrap()
            .contains("name"));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_admitted() {
        let body = review_body("SomethingElse", serde_json::json!({}));
        let (_, value) = post_json(body).await;
        assert_eq!(value["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn test_non_post_yields_405() {
        let response = router()
            .oneshot(
                axum::http::Request::get("/validate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_wrong_content_type_yields_400() {
        let response = router()
            .oneshot(
                axum::http::Request::post("/validate")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
