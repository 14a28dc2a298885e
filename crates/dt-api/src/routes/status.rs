use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/status", get(status))
}

async fn status(State(state): State<ApiState>) -> Json<Value> {
    let report = state.reporter.report().await;
    Json(json!({
        "success": true,
        "targets": report.per_target,
        "summary": report.aggregate,
        "checkedAt": report.checked_at,
        "hints": report.hints,
    }))
}
