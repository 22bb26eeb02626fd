// =============================================================================
// API-key authentication — shared-key check for REST and WebSocket
// =============================================================================
//
// The expected key comes from the `BOREALIS_API_KEY` environment variable.
// When it is unset, authentication is disabled (on-prem default). Comparison
// is constant time to avoid timing side-channels.
//
// REST requests carry the key in the `X-API-Key` header; the WebSocket
// upgrade may use the header or an `apiKey` query parameter.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const API_KEY_ENV: &str = "BOREALIS_API_KEY";
pub const API_KEY_HEADER: &str = "x-api-key";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time over their common length. A
/// length mismatch is observable but does not leak where the bytes differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a presented key against the configured one.
///
/// - No key configured: every request is accepted (auth disabled).
/// - Key configured: the presented key must match exactly.
pub fn validate_key(presented: Option<&str>) -> bool {
    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        return true;
    }
    match presented {
        Some(key) => constant_time_eq(key.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor enforcing the `X-API-Key` header on REST endpoints.
pub struct ApiKey;

pub struct AuthRejection;

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": "AUTHENTICATION_FAILED",
                "message": "Missing or invalid API key",
            },
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ApiKey
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());

        if validate_key(presented) {
            Ok(ApiKey)
        } else {
            warn!("request rejected: invalid API key");
            Err(AuthRejection)
        }
    }
}
