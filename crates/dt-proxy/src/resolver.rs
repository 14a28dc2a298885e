use dt_common::{Registry, TargetCandidate};
use dt_probe::{ProbeMode, Prober};
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type ProbeRound = Shared<BoxFuture<'static, Option<TargetCandidate>>>;

#[derive(Clone)]
struct CacheEntry {
    target: TargetCandidate,
    resolved_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, interval: Duration) -> bool {
        self.resolved_at.elapsed() < interval
    }
}

#[derive(Default)]
struct ResolverState {
    cache: Option<CacheEntry>,
    /// Probe round currently running, tagged with the generation it belongs to
    in_flight: Option<(u64, ProbeRound)>,
    /// Bumped by every new round and every invalidation
    generation: u64,
}

/// Cached view of the active target, for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTarget {
    pub target: TargetCandidate,
    pub age_ms: u64,
    pub fresh: bool,
}

/// Keeps the "currently active" device target.
///
/// A cached target is served without any network call while it is younger
/// than `checkIntervalMs`. Otherwise every registry candidate is probed
/// concurrently and the first reachable one, in registry order, wins.
/// Concurrent callers hitting a stale cache share a single probe round.
pub struct TargetResolver {
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
    state: Arc<Mutex<ResolverState>>,
}

impl TargetResolver {
    pub fn new(registry: Arc<Registry>, prober: Arc<dyn Prober>) -> Self {
        Self {
            registry,
            prober,
            state: Arc::new(Mutex::new(ResolverState::default())),
        }
    }

    pub async fn resolve(&self) -> Option<TargetCandidate> {
        let interval = self.registry.settings().await.check_interval();

        let round = {
            let mut state = self.state.lock().await;

            if let Some(entry) = &state.cache {
                if entry.is_fresh(interval) {
                    return Some(entry.target.clone());
                }
            }

            match &state.in_flight {
                Some((_, round)) => {
                    debug!("Joining in-flight probe round");
                    round.clone()
                }
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let round = probe_round(
                        self.registry.clone(),
                        self.prober.clone(),
                        self.state.clone(),
                        generation,
                    )
                    .boxed()
                    .shared();
                    state.in_flight = Some((generation, round.clone()));
                    round
                }
            }
        };

        round.await
    }

    /// Drop the cached target so the next `resolve()` probes again. A round
    /// already running is detached and will not repopulate the cache.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        let previous = state.cache.take();
        state.in_flight = None;
        state.generation += 1;
        if let Some(entry) = previous {
            info!(target_url = %entry.target, "Active target invalidated");
        }
    }

    /// Invalidate only while `target` is still the cached choice. A stale
    /// failure against a target that was already replaced is ignored.
    pub async fn invalidate_if(&self, target: &TargetCandidate) -> bool {
        let mut state = self.state.lock().await;
        if !state.cache.as_ref().is_some_and(|entry| entry.target == *target) {
            debug!(target_url = %target, "Failed target is no longer cached");
            return false;
        }
        state.cache = None;
        state.in_flight = None;
        state.generation += 1;
        info!(target_url = %target, "Active target invalidated");
        true
    }

    pub async fn cached(&self) -> Option<CachedTarget> {
        let interval = self.registry.settings().await.check_interval();
        let state = self.state.lock().await;
        state.cache.as_ref().map(|entry| CachedTarget {
            target: entry.target.clone(),
            age_ms: entry.resolved_at.elapsed().as_millis() as u64,
            fresh: entry.is_fresh(interval),
        })
    }
}

/// Probe order: the registry's explicit pin first, then the list order.
fn candidate_order(targets: Vec<TargetCandidate>, pinned: Option<TargetCandidate>) -> Vec<TargetCandidate> {
    match pinned {
        Some(pin) => {
            let mut out = Vec::with_capacity(targets.len() + 1);
            out.push(pin.clone());
            out.extend(targets.into_iter().filter(|t| *t != pin));
            out
        }
        None => targets,
    }
}

async fn probe_round(
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
    state: Arc<Mutex<ResolverState>>,
    generation: u64,
) -> Option<TargetCandidate> {
    let candidates = candidate_order(registry.list().await, registry.active().await);
    let credentials = registry.credentials().await;
    let timeout = registry.settings().await.probe_timeout();

    debug!(candidates = candidates.len(), "Resolving active target");

    // join_all keeps input order, so "first reachable" follows registry
    // order whatever order the probes complete in.
    let results = join_all(
        candidates
            .iter()
            .map(|c| prober.probe(c, &credentials, timeout, ProbeMode::Strict)),
    )
    .await;
    let chosen = results.into_iter().find(|r| r.reachable).map(|r| r.target);

    match &chosen {
        Some(target) => info!(target_url = %target, "Active target resolved"),
        None => warn!(candidates = candidates.len(), "No reachable target"),
    }

    let mut s = state.lock().await;
    if s.generation == generation {
        s.in_flight = None;
        s.cache = chosen.clone().map(|target| CacheEntry {
            target,
            resolved_at: Instant::now(),
        });
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use dt_common::{Credentials, Settings, SettingsPatch};
    use dt_probe::{Confidence, ProbeError, ProbeResult};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok { delay_ms: u64 },
        Timeout { delay_ms: u64 },
    }

    #[derive(Default)]
    struct CountingProber {
        behaviors: StdMutex<HashMap<String, Behavior>>,
        calls: AtomicUsize,
    }

    impl CountingProber {
        fn set(&self, url: &str, behavior: Behavior) {
            self.behaviors.lock().unwrap().insert(url.to_string(), behavior);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Prober for CountingProber {
        fn probe<'a>(
            &'a self,
            target: &'a TargetCandidate,
            _credentials: &'a Credentials,
            _timeout: Duration,
            _mode: ProbeMode,
        ) -> BoxFuture<'a, ProbeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(target.as_str())
                .copied()
                .unwrap_or(Behavior::Timeout { delay_ms: 0 });
            async move {
                match behavior {
                    Behavior::Ok { delay_ms } => {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        ProbeResult::responded(target.clone(), 200, delay_ms, Confidence::High, None)
                    }
                    Behavior::Timeout { delay_ms } => {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        ProbeResult::failed(
                            target.clone(),
                            delay_ms,
                            ProbeError::timeout(Duration::from_millis(delay_ms)),
                        )
                    }
                }
            }
            .boxed()
        }
    }

    const INTERVAL_MS: u64 = 30_000;

    fn setup(urls: &[&str]) -> (Arc<Registry>, Arc<CountingProber>, TargetResolver) {
        let targets = urls.iter().map(|u| TargetCandidate::new(*u).unwrap()).collect();
        let registry = Arc::new(Registry::new(targets, Credentials::default(), Settings::default()));
        let prober = Arc::new(CountingProber::default());
        let resolver = TargetResolver::new(registry.clone(), prober.clone());
        (registry, prober, resolver)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_skips_probes() {
        let (_reg, prober, resolver) = setup(&["http://10.0.0.5:8080"]);
        prober.set("http://10.0.0.5:8080", Behavior::Ok { delay_ms: 50 });

        let first = resolver.resolve().await;
        assert_eq!(first.as_ref().map(|t| t.as_str()), Some("http://10.0.0.5:8080"));
        assert_eq!(prober.calls(), 1);

        tokio::time::advance(Duration::from_millis(INTERVAL_MS - 1)).await;
        let second = resolver.resolve().await;
        assert_eq!(second, first);
        assert_eq!(prober.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cache_reprobes_every_candidate() {
        let (_reg, prober, resolver) = setup(&["http://a:1", "http://b:2", "http://c:3"]);
        prober.set("http://b:2", Behavior::Ok { delay_ms: 5 });

        resolver.resolve().await;
        assert_eq!(prober.calls(), 3);

        tokio::time::advance(Duration::from_millis(INTERVAL_MS + 1)).await;
        let again = resolver.resolve().await;
        assert_eq!(again.unwrap().as_str(), "http://b:2");
        assert_eq!(prober.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_reprobe() {
        let (_reg, prober, resolver) = setup(&["http://a:1"]);
        prober.set("http://a:1", Behavior::Ok { delay_ms: 5 });

        resolver.resolve().await;
        resolver.invalidate().await;
        assert!(resolver.cached().await.is_none());

        resolver.resolve().await;
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_detaches_running_round() {
        let (_reg, prober, resolver) = setup(&["http://a:1"]);
        prober.set("http://a:1", Behavior::Ok { delay_ms: 100 });
        let resolver = Arc::new(resolver);

        let r = resolver.clone();
        let waiter = tokio::spawn(async move { r.resolve().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(prober.calls(), 1);

        resolver.invalidate().await;

        // The waiter still gets its answer, but the round no longer owns the cache.
        assert_eq!(waiter.await.unwrap().unwrap().as_str(), "http://a:1");
        assert!(resolver.cached().await.is_none());

        resolver.resolve().await;
        assert_eq!(prober.calls(), 2);
        assert!(resolver.cached().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_if_ignores_replaced_target() {
        let (_reg, prober, resolver) = setup(&["http://x:1", "http://y:2"]);
        prober.set("http://y:2", Behavior::Ok { delay_ms: 5 });
        assert_eq!(resolver.resolve().await.unwrap().as_str(), "http://y:2");

        // A late failure against X must not evict Y.
        let x = TargetCandidate::new("http://x:1").unwrap();
        assert!(!resolver.invalidate_if(&x).await);
        assert_eq!(resolver.cached().await.unwrap().target.as_str(), "http://y:2");

        let y = TargetCandidate::new("http://y:2").unwrap();
        assert!(resolver.invalidate_if(&y).await);
        assert!(resolver.cached().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_resolves_none() {
        let (_reg, prober, resolver) = setup(&[]);
        assert!(resolver.resolve().await.is_none());
        assert_eq!(prober.calls(), 0);
        assert!(resolver.cached().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_reachable_in_list_order() {
        // A times out, B answers: B wins.
        let (_reg, prober, resolver) = setup(&["http://a:1", "http://b:2"]);
        prober.set("http://a:1", Behavior::Timeout { delay_ms: 5_000 });
        prober.set("http://b:2", Behavior::Ok { delay_ms: 50 });
        assert_eq!(resolver.resolve().await.unwrap().as_str(), "http://b:2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_order_beats_completion_order() {
        let (_reg, prober, resolver) = setup(&["http://slow:1", "http://fast:2"]);
        prober.set("http://slow:1", Behavior::Ok { delay_ms: 400 });
        prober.set("http://fast:2", Behavior::Ok { delay_ms: 10 });
        assert_eq!(resolver.resolve().await.unwrap().as_str(), "http://slow:1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_target_probed_first() {
        let (reg, prober, resolver) = setup(&["http://a:1", "http://b:2"]);
        prober.set("http://a:1", Behavior::Ok { delay_ms: 5 });
        prober.set("http://b:2", Behavior::Ok { delay_ms: 5 });
        reg.set_active(Some(TargetCandidate::new("http://b:2").unwrap())).await;

        assert_eq!(resolver.resolve().await.unwrap().as_str(), "http://b:2");
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_share_one_round() {
        let (_reg, prober, resolver) = setup(&["http://a:1", "http://b:2"]);
        prober.set("http://a:1", Behavior::Timeout { delay_ms: 100 });
        prober.set("http://b:2", Behavior::Ok { delay_ms: 100 });

        let results = join_all((0..10).map(|_| resolver.resolve())).await;

        assert!(results.iter().all(|r| r.as_ref().map(|t| t.as_str()) == Some("http://b:2")));
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reachable_clears_cache() {
        let (_reg, prober, resolver) = setup(&["http://a:1"]);
        prober.set("http://a:1", Behavior::Ok { delay_ms: 5 });
        resolver.resolve().await;

        tokio::time::advance(Duration::from_millis(INTERVAL_MS)).await;
        prober.set("http://a:1", Behavior::Timeout { delay_ms: 5 });
        assert!(resolver.resolve().await.is_none());
        assert!(resolver.cached().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_interval_follows_settings() {
        let (reg, prober, resolver) = setup(&["http://a:1"]);
        prober.set("http://a:1", Behavior::Ok { delay_ms: 5 });
        reg.update_settings(SettingsPatch {
            check_interval_ms: Some(1_000),
            ..Default::default()
        })
        .await;

        resolver.resolve().await;
        tokio::time::advance(Duration::from_millis(1_001)).await;
        resolver.resolve().await;
        assert_eq!(prober.calls(), 2);
    }

    #[test]
    fn test_candidate_order_dedups_pin() {
        let t = |u: &str| TargetCandidate::new(u).unwrap();
        let order = candidate_order(vec![t("http://a:1"), t("http://b:2")], Some(t("http://b:2")));
        assert_eq!(order, vec![t("http://b:2"), t("http://a:1")]);

        let order = candidate_order(vec![t("http://a:1")], Some(t("http://z:9")));
        assert_eq!(order, vec![t("http://z:9"), t("http://a:1")]);
    }
}
