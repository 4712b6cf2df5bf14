//! Bearer-token authentication middleware for the data endpoints.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::app::AppState;

/// Compare the presented key against the configured key in constant time.
/// Both sides are hashed first so the comparison length never depends on
/// either input.
pub fn api_key_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented.as_slice().ct_eq(expected.as_slice()).into()
}

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if api_key_matches(key, &state.config.proxy_api_key) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "rejected request with missing or invalid API key");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": {
                        "message": "Invalid or missing API key",
                        "type": "authentication_error",
                    }
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_keys_accepted() {
        assert!(api_key_matches("secret-key", "secret-key"));
    }

    #[test]
    fn mismatched_keys_rejected() {
        assert!(!api_key_matches("secret-kex", "secret-key"));
        assert!(!api_key_matches("", "secret-key"));
        assert!(!api_key_matches("secret-key-longer", "secret-key"));
    }
}
