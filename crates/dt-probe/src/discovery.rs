use dt_common::{Credentials, DiscoveryConfig, TargetCandidate};
use futures_util::future::join_all;
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::probe::{ProbeMode, ProbeResult, Prober};

/// Outcome of one scan. Built per call, never stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub total_tested: usize,
    /// Live servers, best first
    pub found: Vec<ProbeResult>,
    pub primary: Option<ProbeResult>,
    pub backups: Vec<ProbeResult>,
    pub duration_ms: u64,
    pub recommendations: Vec<String>,
}

/// Brute-force LAN scanner over prefixes × ports × hosts
pub struct Scanner {
    prober: Arc<dyn Prober>,
}

impl Scanner {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Candidate URLs, prefix-major, then port, then host. Never more than
    /// `max_candidates`.
    pub fn candidates(config: &DiscoveryConfig) -> Vec<TargetCandidate> {
        let limit = config.max_candidates;
        let count = config.candidate_count().unwrap_or(usize::MAX);
        if count > limit {
            warn!(candidates = count, limit, "Discovery range truncated");
        }

        let mut out = Vec::with_capacity(count.min(limit));
        for prefix in &config.prefixes {
            for port in &config.ports {
                for host in &config.hosts {
                    if out.len() >= limit {
                        return out;
                    }
                    let url = format!("{}://{}.{}:{}", config.scheme, prefix, host, port);
                    match TargetCandidate::new(url) {
                        Ok(c) => out.push(c),
                        Err(e) => warn!("Skipping discovery candidate: {}", e),
                    }
                }
            }
        }
        out
    }

    /// Probe every candidate, one batch at a time.
    ///
    /// Probes inside a batch run concurrently; the next batch starts only
    /// once the current one has fully drained, so at most `batch_size`
    /// requests are ever in flight.
    pub async fn scan(
        &self,
        config: &DiscoveryConfig,
        credentials: &Credentials,
        timeout: Duration,
    ) -> DiscoveryReport {
        let start = Instant::now();
        let candidates = Self::candidates(config);
        let total = candidates.len();
        let batch_size = config.batch_size.max(1);

        info!(
            candidates = total,
            batch_size,
            timeout_ms = timeout.as_millis() as u64,
            "Discovery scan started"
        );

        let mut found: Vec<ProbeResult> = Vec::new();
        let mut tested = 0usize;

        for batch in candidates.chunks(batch_size) {
            let probes = batch
                .iter()
                .map(|c| self.prober.probe(c, credentials, timeout, ProbeMode::Discovery));
            let results = join_all(probes).await;

            for result in results {
                if result.reachable {
                    debug!(target_url = %result.target, status = ?result.http_status, "Device server found");
                    found.push(result);
                }
            }

            let previous = tested;
            tested += batch.len();
            if config.progress_every > 0 && tested / config.progress_every > previous / config.progress_every {
                info!(tested, total, found = found.len(), "Discovery progress");
            }
        }

        rank_results(&mut found);

        let primary = found.first().cloned();
        let backups: Vec<ProbeResult> = found.iter().skip(1).take(2).cloned().collect();
        let recommendations = recommendations(primary.as_ref(), &backups);
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(tested, found = found.len(), duration_ms, "Discovery scan finished");

        DiscoveryReport {
            total_tested: tested,
            found,
            primary,
            backups,
            duration_ms,
            recommendations,
        }
    }
}

/// Drop unreachable results, then sort by confidence (desc) and HTTP status
/// (asc, missing last). Ties keep scan order.
pub fn rank_results(results: &mut Vec<ProbeResult>) {
    results.retain(|r| r.reachable);
    results.sort_by_key(|r| (Reverse(r.confidence.rank()), r.http_status.unwrap_or(u16::MAX)));
}

fn recommendations(primary: Option<&ProbeResult>, backups: &[ProbeResult]) -> Vec<String> {
    let Some(primary) = primary else {
        return vec![
            "No device server found on the scanned networks".to_string(),
            "Check the device is on the same network as this service".to_string(),
            "Make sure the file server app is running on the device".to_string(),
            "If the device uses another subnet or port, extend the discovery prefixes/ports".to_string(),
        ];
    };

    let mut out = vec![format!(
        "Use {} as primary target (HTTP {})",
        primary.target,
        primary
            .http_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".to_string())
    )];
    for backup in backups {
        out.push(format!("Keep {} as backup target", backup.target));
    }
    out.push("Register targets with PUT /api/targets or rerun discovery with apply=true".to_string());
    out
}
