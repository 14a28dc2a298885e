use dt_common::{DiscoveryConfig, Registry};
use dt_probe::{Prober, Scanner, StatusReporter};
use dt_proxy::{Forwarder, OptionalAccessLogger, TargetResolver};
use std::sync::Arc;

/// Shared application state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub resolver: Arc<TargetResolver>,
    pub forwarder: Arc<Forwarder>,
    pub scanner: Arc<Scanner>,
    pub reporter: Arc<StatusReporter>,
    /// Default scan ranges for the discovery endpoints
    pub discovery: Arc<DiscoveryConfig>,
}

impl ApiState {
    /// Wire every component around one registry and one prober.
    pub fn new(
        registry: Arc<Registry>,
        prober: Arc<dyn Prober>,
        discovery: DiscoveryConfig,
        access_logger: OptionalAccessLogger,
    ) -> reqwest::Result<Self> {
        let resolver = Arc::new(TargetResolver::new(registry.clone(), prober.clone()));
        let forwarder = Forwarder::new(registry.clone(), resolver.clone(), access_logger)?;

        Ok(Self {
            scanner: Arc::new(Scanner::new(prober.clone())),
            reporter: Arc::new(StatusReporter::new(registry.clone(), prober)),
            forwarder: Arc::new(forwarder),
            resolver,
            registry,
            discovery: Arc::new(discovery),
        })
    }
}
