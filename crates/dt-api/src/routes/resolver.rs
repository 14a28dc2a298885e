use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/resolver", get(cached).delete(invalidate))
}

/// Current cached choice, without probing
async fn cached(State(state): State<ApiState>) -> Json<Value> {
    let cached = state.resolver.cached().await;
    Json(json!({
        "success": true,
        "active": cached,
        "pinned": state.registry.active().await,
    }))
}

async fn invalidate(State(state): State<ApiState>) -> Json<Value> {
    state.resolver.invalidate().await;
    Json(json!({"success": true}))
}
