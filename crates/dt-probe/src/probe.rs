use dt_common::{Credentials, TargetCandidate};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::header::{HeaderMap, HeaderName, AUTHORIZATION, CONTENT_TYPE, SERVER};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

pub const USER_AGENT: &str = concat!("devtunnel/", env!("CARGO_PKG_VERSION"));

/// Network-level failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    NetworkOther,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection-refused",
            FailureKind::NetworkOther => "network-other",
        }
    }

    /// Plain-language cause shown to users
    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::ConnectionRefused => "target not running or wrong address",
            FailureKind::Timeout => "target too slow or dead",
            FailureKind::NetworkOther => "network/DNS error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct ProbeError {
    pub kind: FailureKind,
    pub message: String,
}

impl ProbeError {
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("no response within {} ms", after.as_millis()),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        Self {
            kind: classify_error(err),
            message: error_chain(err),
        }
    }
}

/// Full error text including sources ("error sending request: connection refused ...")
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        text.push_str(": ");
        text.push_str(&e.to_string());
        source = e.source();
    }
    text
}

/// Map a transport error onto a [`FailureKind`].
pub fn classify_error(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        return FailureKind::Timeout;
    }

    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return FailureKind::ConnectionRefused,
                std::io::ErrorKind::TimedOut => return FailureKind::Timeout,
                _ => {}
            }
        }
        source = e.source();
    }

    if is_connection_refused(&error_chain(err)) {
        FailureKind::ConnectionRefused
    } else {
        FailureKind::NetworkOther
    }
}

fn is_connection_refused(err: &str) -> bool {
    err.contains("Connection refused")
        || err.contains("connection refused")
        || err.contains("os error 111") // ECONNREFUSED on Linux
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    None,
}

impl Confidence {
    /// Sort rank, higher is better
    pub fn rank(&self) -> u8 {
        match self {
            Confidence::High => 2,
            Confidence::Medium => 1,
            Confidence::None => 0,
        }
    }
}

/// Which responses count as "alive"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// 200 or 401 only
    Strict,
    /// Also any HTML page or a server header naming android/ftp firmware
    Discovery,
}

/// Classify a response. 200 is high confidence, any other accepted response
/// is medium, everything else is none.
pub fn classify(status: u16, content_type: Option<&str>, server: Option<&str>, mode: ProbeMode) -> Confidence {
    match status {
        200 => return Confidence::High,
        401 => return Confidence::Medium,
        _ => {}
    }
    if mode == ProbeMode::Strict {
        return Confidence::None;
    }

    let html = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false);
    let device_server = server
        .map(|s| {
            let s = s.to_ascii_lowercase();
            s.contains("android") || s.contains("ftp")
        })
        .unwrap_or(false);

    if html || device_server {
        Confidence::Medium
    } else {
        Confidence::None
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub target: TargetCandidate,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProbeError>,
}

impl ProbeResult {
    pub fn responded(
        target: TargetCandidate,
        status: u16,
        latency_ms: u64,
        confidence: Confidence,
        server: Option<String>,
    ) -> Self {
        Self {
            target,
            reachable: confidence != Confidence::None,
            http_status: Some(status),
            latency_ms,
            confidence,
            server,
            error: None,
        }
    }

    pub fn failed(target: TargetCandidate, latency_ms: u64, error: ProbeError) -> Self {
        Self {
            target,
            reachable: false,
            http_status: None,
            latency_ms,
            confidence: Confidence::None,
            server: None,
            error: Some(error),
        }
    }
}

/// Health check of a single candidate.
///
/// Implementations never fail: every transport problem is folded into the
/// returned [`ProbeResult`].
pub trait Prober: Send + Sync {
    fn probe<'a>(
        &'a self,
        target: &'a TargetCandidate,
        credentials: &'a Credentials,
        timeout: Duration,
        mode: ProbeMode,
    ) -> BoxFuture<'a, ProbeResult>;
}

/// HEAD-request prober backed by a shared reqwest client
#[derive(Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> reqwest::Result<Self> {
        // LAN devices are never reached through a system proxy
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn run(
        &self,
        target: &TargetCandidate,
        credentials: &Credentials,
        timeout: Duration,
        mode: ProbeMode,
    ) -> ProbeResult {
        let start = Instant::now();
        let request = self
            .client
            .head(target.as_str())
            .header(AUTHORIZATION, credentials.basic_header())
            .send();

        // Dropping the request future on expiry aborts the connection attempt.
        let outcome = tokio::time::timeout(timeout, request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => ProbeResult::failed(target.clone(), latency_ms, ProbeError::timeout(timeout)),
            Ok(Err(e)) => ProbeResult::failed(target.clone(), latency_ms, ProbeError::from_reqwest(&e)),
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let content_type = header_str(resp.headers(), CONTENT_TYPE);
                let server = header_str(resp.headers(), SERVER);
                let confidence = classify(status, content_type.as_deref(), server.as_deref(), mode);
                ProbeResult::responded(target.clone(), status, latency_ms, confidence, server)
            }
        };

        debug!(
            target_url = %target,
            reachable = result.reachable,
            status = ?result.http_status,
            latency_ms,
            "Probe finished"
        );
        result
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

impl Prober for HttpProber {
    fn probe<'a>(
        &'a self,
        target: &'a TargetCandidate,
        credentials: &'a Credentials,
        timeout: Duration,
        mode: ProbeMode,
    ) -> BoxFuture<'a, ProbeResult> {
        self.run(target, credentials, timeout, mode).boxed()
    }
}
