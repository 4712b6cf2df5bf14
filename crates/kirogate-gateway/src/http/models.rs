use axum::Json;
use serde_json::{json, Value};

/// GET /v1/models — OpenAI-shaped model listing.
pub async fn list_models() -> Json<Value> {
    let data: Vec<Value> = kirogate_core::models::available_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "anthropic",
            })
        })
        .collect();

    Json(json!({
        "object": "list",
        "data": data,
    }))
}
