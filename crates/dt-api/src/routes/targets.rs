use axum::{
    extract::{rejection::JsonRejection, State},
    routing::get,
    Json, Router,
};
use dt_common::{RegistryUpdate, TargetCandidate};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route(
        "/targets",
        get(list).post(update).put(add).delete(remove),
    )
}

#[derive(Deserialize)]
struct TargetBody {
    #[serde(default)]
    target: Option<String>,
}

impl TargetBody {
    fn candidate(self) -> Result<TargetCandidate, ApiError> {
        let raw = self
            .target
            .ok_or_else(|| ApiError::MalformedInput("missing field `target`".to_string()))?;
        Ok(TargetCandidate::new(raw)?)
    }
}

async fn list(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.registry.snapshot().await;
    Json(json!({"success": true, "registry": snapshot}))
}

async fn update(
    State(state): State<ApiState>,
    body: Result<Json<RegistryUpdate>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(update) = body?;
    state.registry.apply(update).await;
    // Targets or credentials may have changed under the cached choice.
    state.resolver.invalidate().await;

    let snapshot = state.registry.snapshot().await;
    info!(targets = snapshot.targets.len(), "Registry updated");
    Ok(Json(json!({"success": true, "registry": snapshot})))
}

async fn add(
    State(state): State<ApiState>,
    body: Result<Json<TargetBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let candidate = body.candidate()?;
    let added = state.registry.add(candidate.clone()).await;

    Ok(Json(json!({
        "success": true,
        "target": candidate,
        "added": added,
        "targets": state.registry.list().await,
    })))
}

async fn remove(
    State(state): State<ApiState>,
    body: Result<Json<TargetBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body?;
    let candidate = body.candidate()?;
    let removed = state.registry.remove(&candidate).await;

    if removed {
        state.resolver.invalidate_if(&candidate).await;
    }

    Ok(Json(json!({
        "success": true,
        "target": candidate,
        "removed": removed,
        "targets": state.registry.list().await,
    })))
}
