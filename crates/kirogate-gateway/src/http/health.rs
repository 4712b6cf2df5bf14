use axum::Json;
use serde_json::{json, Value};

use kirogate_core::config::APP_VERSION;

/// GET / — service banner, no auth.
pub async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Kirogate: OpenAI/Anthropic gateway for the Kiro upstream",
        "version": APP_VERSION,
    }))
}

/// GET /health — liveness probe, no auth.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": APP_VERSION,
    }))
}
