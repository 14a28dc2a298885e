mod supervisor;

use anyhow::Context;
use dt_api::state::ApiState;
use dt_common::config::{EnvConfig, TunnelConfig};
use dt_common::Registry;
use dt_probe::{HttpProber, Prober, Scanner};
use dt_proxy::{OptionalAccessLogger, TargetResolver};
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use supervisor::{spawn_supervised, RestartPolicy};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,devtunnel=debug")),
        )
        .init();

    info!("devtunnel {} starting...", env!("CARGO_PKG_VERSION"));

    let env = EnvConfig::load(None);
    let mut config = load_or_create_config(&env.config_path)?;
    env.override_config(&mut config);
    info!("Config: {}", env.config_path.display());

    // ── Core components ────────────────────────────────────────────────

    let registry = Arc::new(Registry::new(
        config.target_candidates(),
        config.credentials.clone(),
        config.settings.clone(),
    ));
    let prober: Arc<dyn Prober> = Arc::new(HttpProber::new().context("Failed to build HTTP client")?);
    let access_logger = OptionalAccessLogger::new(config.access_log_path.as_deref().map(Path::new));

    let state = ApiState::new(registry.clone(), prober, config.discovery.clone(), access_logger)
        .context("Failed to build forwarder")?;

    // ── Background tasks ───────────────────────────────────────────────

    if config.settings.auto_discovery && registry.list().await.is_empty() {
        let scanner = state.scanner.clone();
        let registry = registry.clone();
        let discovery = config.discovery.clone();
        tokio::spawn(async move {
            auto_discover(&scanner, &registry, &discovery).await;
        });
    }

    {
        let config_path = env.config_path.clone();
        let env = env.clone();
        let registry = registry.clone();
        let resolver = state.resolver.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_sighup(&config_path, &env, registry, resolver).await {
                error!("SIGHUP handler error: {}", e);
            }
        });
    }

    // ── HTTP API ───────────────────────────────────────────────────────

    let ip: IpAddr = env
        .bind
        .parse()
        .with_context(|| format!("Invalid DEVTUNNEL_BIND address: {}", env.bind))?;
    let addr = SocketAddr::new(ip, env.port);
    let router = dt_api::build_router(state);

    spawn_supervised("api", RestartPolicy::SERVER, move || {
        let router = router.clone();
        async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("API listening on {}", addr);
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;
            Ok::<(), anyhow::Error>(())
        }
    });

    let targets = registry.list().await;
    info!("devtunnel started");
    info!("  Targets: {}", targets.len());
    for t in &targets {
        info!("    {}", t);
    }
    info!(
        "  Auto-discovery: {}",
        if config.settings.auto_discovery { "enabled" } else { "disabled" }
    );
    info!(
        "  Access log: {}",
        config.access_log_path.as_deref().unwrap_or("disabled")
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}

/// Read the config file, writing the defaults first when it does not exist.
fn load_or_create_config(path: &Path) -> anyhow::Result<TunnelConfig> {
    if path.exists() {
        return TunnelConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    info!("No config file at {}, using defaults", path.display());
    let config = TunnelConfig::default();
    if let Err(e) = config.save_to_file(path) {
        warn!("Could not write default config to {}: {:#}", path.display(), e);
    }
    Ok(config)
}

/// Startup scan for an empty registry. Found servers are registered through
/// the normal `add` path, primary first.
async fn auto_discover(scanner: &Scanner, registry: &Registry, discovery: &dt_common::DiscoveryConfig) {
    info!("Registry is empty, running auto-discovery");
    let credentials = registry.credentials().await;
    let timeout = registry.settings().await.discovery_timeout();
    let report = scanner.scan(discovery, &credentials, timeout).await;

    let Some(primary) = report.primary else {
        warn!(tested = report.total_tested, "Auto-discovery found no device server");
        return;
    };

    let mut added = 0;
    for result in std::iter::once(primary).chain(report.backups) {
        if registry.add(result.target).await {
            added += 1;
        }
    }
    info!(added, duration_ms = report.duration_ms, "Auto-discovery registered targets");
}

async fn handle_sighup(
    config_path: &Path,
    env: &EnvConfig,
    registry: Arc<Registry>,
    resolver: Arc<TargetResolver>,
) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, reloading config...");

            match TunnelConfig::load_from_file(config_path) {
                Ok(mut config) => {
                    env.override_config(&mut config);
                    let targets = config.target_candidates();
                    let count = targets.len();
                    registry.reload(targets, config.credentials, config.settings).await;
                    resolver.invalidate().await;
                    info!(targets = count, "Config reloaded");
                }
                Err(e) => {
                    error!("Failed to reload config: {:#}", e);
                }
            }
        }
    }

    Ok(())
}
