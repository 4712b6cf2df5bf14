use axum::{extract::State, Json};
use serde_json::Value;
use std::sync::Arc;

use crate::app::AppState;

/// GET /v1/accounts/status — credential health, refresh tokens masked.
pub async fn accounts_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.auth.status().await)
}
