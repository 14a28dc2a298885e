use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How a supervised task is restarted after an error or a panic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_retries: u32,
    /// Delay grows linearly: `step * attempt`
    pub backoff_step: Duration,
    /// A run longer than this resets the attempt counter
    pub healthy_after: Duration,
}

impl RestartPolicy {
    /// The HTTP listener: quick restarts, gives up after ten in a row
    pub const SERVER: RestartPolicy = RestartPolicy {
        max_retries: 10,
        backoff_step: Duration::from_secs(1),
        healthy_after: Duration::from_secs(60),
    };

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

/// Run `factory()` in its own task and restart it when it fails.
///
/// A clean `Ok(())` exit ends supervision.
pub fn spawn_supervised<F, Fut>(name: &'static str, policy: RestartPolicy, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let mut attempt: u32 = 0;

        loop {
            info!(service = name, "Starting service");
            let started = Instant::now();

            let f = Arc::clone(&factory);
            match tokio::spawn(async move { f().await }).await {
                Ok(Ok(())) => {
                    info!(service = name, "Service exited cleanly");
                    return;
                }
                Ok(Err(e)) => error!(service = name, "Service failed: {e:#}"),
                Err(join_error) => error!(service = name, "Service task panicked: {join_error}"),
            }

            if started.elapsed() > policy.healthy_after {
                attempt = 0;
            }
            attempt = attempt.saturating_add(1);

            if attempt > policy.max_retries {
                error!(service = name, max_retries = policy.max_retries, "Giving up on service");
                return;
            }

            let delay = policy.backoff(attempt);
            warn!(service = name, attempt, "Restarting service in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    })
}
