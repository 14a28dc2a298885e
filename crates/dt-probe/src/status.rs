use chrono::{DateTime, Utc};
use dt_common::{Registry, TargetCandidate};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::probe::{ProbeMode, ProbeResult, Prober};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAggregate {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    /// Mean over online targets; absent when nothing is online
    pub average_latency_ms: Option<u64>,
    /// Fastest online target
    pub recommended: Option<TargetCandidate>,
}

impl StatusAggregate {
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let online: Vec<&ProbeResult> = results.iter().filter(|r| r.reachable).collect();

        let average_latency_ms = if online.is_empty() {
            None
        } else {
            let sum: u64 = online.iter().map(|r| r.latency_ms).sum();
            Some(sum / online.len() as u64)
        };

        // min_by_key keeps the first of equal elements, i.e. registry order
        let recommended = online
            .iter()
            .min_by_key(|r| r.latency_ms)
            .map(|r| r.target.clone());

        Self {
            total: results.len(),
            online: online.len(),
            offline: results.len() - online.len(),
            average_latency_ms,
            recommended,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub per_target: Vec<ProbeResult>,
    pub aggregate: StatusAggregate,
    pub checked_at: DateTime<Utc>,
    /// Troubleshooting steps, present when any target is offline
    pub hints: Vec<String>,
}

/// Probes every registered target on demand. Nothing is cached.
pub struct StatusReporter {
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
}

impl StatusReporter {
    pub fn new(registry: Arc<Registry>, prober: Arc<dyn Prober>) -> Self {
        Self { registry, prober }
    }

    pub async fn report(&self) -> StatusReport {
        let targets = self.registry.list().await;
        let credentials = self.registry.credentials().await;
        let timeout = self.registry.settings().await.probe_timeout();

        let probes = targets
            .iter()
            .map(|t| self.prober.probe(t, &credentials, timeout, ProbeMode::Strict));
        let per_target = join_all(probes).await;

        for r in &per_target {
            debug!(target_url = %r.target, reachable = r.reachable, latency_ms = r.latency_ms, "Status probe");
        }

        let aggregate = StatusAggregate::from_results(&per_target);
        info!(
            total = aggregate.total,
            online = aggregate.online,
            offline = aggregate.offline,
            "Status check finished"
        );

        let hints = troubleshooting_hints(&aggregate);
        StatusReport {
            per_target,
            aggregate,
            checked_at: Utc::now(),
            hints,
        }
    }
}

fn troubleshooting_hints(aggregate: &StatusAggregate) -> Vec<String> {
    let mut hints = Vec::new();
    if aggregate.total == 0 {
        hints.push("No targets registered: add one with PUT /api/targets or run /api/discovery".to_string());
        return hints;
    }
    if aggregate.offline == 0 {
        return hints;
    }
    hints.push("Check the device is on the same network as this service".to_string());
    hints.push("Make sure the file server app is running and the screen is unlocked".to_string());
    hints.push("Verify the IP address and port shown by the app match the registered target".to_string());
    if aggregate.online == 0 {
        hints.push("No target is reachable: run /api/discovery to find the device's current address".to_string());
    }
    hints
}
