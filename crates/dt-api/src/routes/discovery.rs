use axum::{
    body::Bytes,
    extract::State,
    routing::get,
    Json, Router,
};
use dt_common::DiscoveryConfig;
use dt_probe::DiscoveryReport;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use crate::error::ApiError;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/discovery", get(scan_defaults).post(scan))
}

/// Optional overrides for one scan. Absent fields use the configured ranges.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanRequest {
    #[serde(default)]
    prefixes: Option<Vec<String>>,
    #[serde(default)]
    ports: Option<Vec<u16>>,
    #[serde(default)]
    hosts: Option<Vec<u8>>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Add the primary and backup results to the registry
    #[serde(default)]
    apply: bool,
}

impl ScanRequest {
    fn merged(&self, defaults: &DiscoveryConfig) -> Result<DiscoveryConfig, ApiError> {
        let mut config = defaults.clone();
        if let Some(prefixes) = &self.prefixes {
            config.prefixes = prefixes.clone();
        }
        if let Some(ports) = &self.ports {
            config.ports = ports.clone();
        }
        if let Some(hosts) = &self.hosts {
            config.hosts = hosts.clone();
        }
        if let Some(batch_size) = self.batch_size {
            if batch_size == 0 {
                return Err(ApiError::MalformedInput("batchSize must be at least 1".to_string()));
            }
            config.batch_size = batch_size;
        }
        config.check_size()?;
        Ok(config)
    }
}

async fn scan_defaults(State(state): State<ApiState>) -> Json<Value> {
    let report = run_scan(&state, &state.discovery, None).await;
    Json(json!({"success": true, "report": report}))
}

async fn scan(State(state): State<ApiState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: ScanRequest = if body.iter().all(|b| b.is_ascii_whitespace()) {
        ScanRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };

    let config = request.merged(&state.discovery)?;
    let timeout = request.timeout_ms.map(Duration::from_millis);
    let report = run_scan(&state, &config, timeout).await;

    let mut applied = Vec::new();
    if request.apply {
        for result in report.primary.iter().chain(report.backups.iter()) {
            if state.registry.add(result.target.clone()).await {
                applied.push(result.target.clone());
            }
        }
        info!(applied = applied.len(), "Discovery results added to registry");
    }

    Ok(Json(json!({"success": true, "report": report, "applied": applied})))
}

async fn run_scan(state: &ApiState, config: &DiscoveryConfig, timeout: Option<Duration>) -> DiscoveryReport {
    let credentials = state.registry.credentials().await;
    let timeout = match timeout {
        Some(t) => t,
        None => state.registry.settings().await.discovery_timeout(),
    };
    state.scanner.scan(config, &credentials, timeout).await
}
