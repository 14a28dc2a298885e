use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{OriginalUri, Request};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dt_common::{Credentials, Registry, TargetCandidate};
use dt_probe::{FailureKind, ProbeError, USER_AGENT};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::logging::{self, AccessLogEntry, OptionalAccessLogger};
use crate::resolver::TargetResolver;

/// Largest inbound body relayed to a device
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

pub const TUNNEL_SOURCE: &str = "devtunnel";

const HOP_BY_HOP: [&str; 6] = ["connection", "keep-alive", "proxy-connection", "te", "trailer", "upgrade"];

/// Forward errors
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("No reachable target")]
    NoTarget,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forward to {target} failed: {error}")]
    Upstream { target: TargetCandidate, error: ProbeError },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForwardError {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::NoTarget => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ForwardError::Upstream { .. } | ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::NoTarget => "no-target",
            ForwardError::BadRequest(_) => "malformed-input",
            ForwardError::Upstream { .. } => "upstream-failed",
            ForwardError::Internal(_) => "internal",
        }
    }

    fn target(&self) -> Option<&TargetCandidate> {
        match self {
            ForwardError::Upstream { target, .. } => Some(target),
            _ => None,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = match self {
            ForwardError::NoTarget => json!({
                "success": false,
                "error": code,
                "message": "No reachable device server",
                "suggestions": [
                    "Check the device is on the same network as this service",
                    "Make sure the file server app is running on the device",
                    "Run GET /api/status to see which targets respond",
                    "Run GET /api/discovery to find the device's current address",
                ],
            }),
            ForwardError::Upstream { target, error } => json!({
                "success": false,
                "error": code,
                "cause": error.kind,
                "message": error.kind.describe(),
                "detail": error.message,
                "target": target,
                "suggestions": upstream_suggestions(error.kind),
            }),
            ForwardError::BadRequest(message) | ForwardError::Internal(message) => json!({
                "success": false,
                "error": code,
                "message": message,
            }),
        };
        (status, Json(body)).into_response()
    }
}

fn upstream_suggestions(kind: FailureKind) -> Vec<&'static str> {
    match kind {
        FailureKind::ConnectionRefused => vec![
            "Start the file server app on the device",
            "Verify the registered port matches the one shown by the app",
        ],
        FailureKind::Timeout => vec![
            "Wake the device and keep the screen on",
            "Raise settings.timeoutMs for large transfers",
        ],
        FailureKind::NetworkOther => vec![
            "Check the target address is valid and on this network",
            "Run GET /api/discovery to find the device again",
        ],
    }
}

/// Relays requests to whatever target the resolver currently picks
pub struct Forwarder {
    registry: Arc<Registry>,
    resolver: Arc<TargetResolver>,
    client: reqwest::Client,
    access_logger: OptionalAccessLogger,
}

impl Forwarder {
    pub fn new(
        registry: Arc<Registry>,
        resolver: Arc<TargetResolver>,
        access_logger: OptionalAccessLogger,
    ) -> reqwest::Result<Self> {
        // Redirects go back to the client untouched.
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self::with_client(registry, resolver, client, access_logger))
    }

    pub fn with_client(
        registry: Arc<Registry>,
        resolver: Arc<TargetResolver>,
        client: reqwest::Client,
        access_logger: OptionalAccessLogger,
    ) -> Self {
        Self {
            registry,
            resolver,
            client,
            access_logger,
        }
    }

    /// Forward one request. Failures are rendered as JSON responses.
    pub async fn forward(&self, client_ip: Option<IpAddr>, req: Request) -> Response {
        let start = Instant::now();

        let method = req.method().to_string();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let result = self.forward_inner(client_ip, req).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (target, response) = match result {
            Ok((target, response)) => {
                info!(
                    %method,
                    %path,
                    target_url = %target,
                    status = response.status().as_u16(),
                    duration_ms,
                    "Forwarded"
                );
                (Some(target), response)
            }
            Err(e) => {
                warn!(%method, %path, error = %e, duration_ms, "Forward failed");
                (e.target().cloned(), e.into_response())
            }
        };

        self.access_logger.log(AccessLogEntry {
            timestamp: logging::now_timestamp(),
            client_ip: client_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string()),
            method,
            path,
            target: target.map(|t| t.to_string()),
            status: response.status().as_u16(),
            duration_ms,
            user_agent,
        });

        response
    }

    async fn forward_inner(
        &self,
        client_ip: Option<IpAddr>,
        req: Request,
    ) -> Result<(TargetCandidate, Response), ForwardError> {
        let target = self.resolver.resolve().await.ok_or(ForwardError::NoTarget)?;
        let settings = self.registry.settings().await;
        let credentials = self.registry.credentials().await;

        let (origin, authority) = match target_origin(&target) {
            Ok(v) => v,
            Err(message) => {
                let error = ProbeError {
                    kind: FailureKind::NetworkOther,
                    message,
                };
                return Err(self.upstream_failure(target, error).await);
            }
        };

        let (parts, body) = req.into_parts();
        let original_url = parts
            .extensions
            .get::<OriginalUri>()
            .map(|u| u.0.to_string())
            .unwrap_or_else(|| parts.uri.to_string());
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let url = format!("{}{}", origin, path);

        let headers = forwarded_request_headers(&parts.headers, &authority, client_ip, &original_url, &credentials);
        let mut builder = self.client.request(parts.method.clone(), &url).headers(headers);

        if parts.method != Method::GET && parts.method != Method::HEAD {
            let bytes = to_bytes(body, MAX_BODY_BYTES)
                .await
                .map_err(|e| ForwardError::BadRequest(format!("Failed to read request body: {}", e)))?;
            builder = builder.body(bytes);
        }

        let timeout = settings.forward_timeout();
        let exchange = async {
            let resp = builder.send().await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let bytes = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, bytes))
        };

        // Expiry drops the exchange future, which aborts the upstream request.
        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(self.upstream_failure(target, ProbeError::timeout(timeout)).await),
            Ok(Err(e)) => Err(self.upstream_failure(target, ProbeError::from_reqwest(&e)).await),
            Ok(Ok((status, headers, bytes))) => {
                let response = relay_response(status, &headers, bytes, &target);
                Ok((target, response))
            }
        }
    }

    /// The target just failed: drop it, if still cached, so the next request re-probes.
    async fn upstream_failure(&self, target: TargetCandidate, error: ProbeError) -> ForwardError {
        self.resolver.invalidate_if(&target).await;
        ForwardError::Upstream { target, error }
    }
}

/// `(scheme://authority, authority)` of a target base URL
fn target_origin(target: &TargetCandidate) -> Result<(String, String), String> {
    let url = reqwest::Url::parse(target.as_str()).map_err(|e| format!("invalid target URL: {}", e))?;
    let host = url
        .host_str()
        .ok_or_else(|| format!("target URL has no host: {}", target))?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Ok((format!("{}://{}", url.scheme(), authority), authority))
}

fn forwarded_request_headers(
    inbound: &HeaderMap,
    authority: &str,
    client_ip: Option<IpAddr>,
    original_url: &str,
    credentials: &Credentials,
) -> HeaderMap {
    let mut headers = inbound.clone();

    // Headers named by Connection are hop-by-hop as well
    let listed: Vec<HeaderName> = inbound
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::ACCEPT_ENCODING);

    if let Ok(v) = HeaderValue::from_str(authority) {
        headers.insert(header::HOST, v);
    }

    let client = client_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string());
    if let Ok(v) = HeaderValue::from_str(&client) {
        headers.insert("x-forwarded-for", v);
    }
    let proto = inbound
        .get("x-forwarded-proto")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("http"));
    headers.insert("x-forwarded-proto", proto);
    if let Ok(v) = HeaderValue::from_str(original_url) {
        headers.insert("x-original-url", v);
    }

    if !headers.contains_key(header::AUTHORIZATION) {
        if let Ok(v) = HeaderValue::from_str(&credentials.basic_header()) {
            headers.insert(header::AUTHORIZATION, v);
        }
    }

    headers
}

fn relay_response(status: StatusCode, upstream: &HeaderMap, body: Bytes, target: &TargetCandidate) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    let out = response.headers_mut();
    for (name, value) in upstream {
        if is_dropped_response_header(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    out.insert("x-tunnel-source", HeaderValue::from_static(TUNNEL_SOURCE));
    if let Ok(v) = HeaderValue::from_str(target.as_str()) {
        out.insert("x-tunnel-target", v);
    }
    if let Ok(v) = HeaderValue::from_str(&logging::now_timestamp()) {
        out.insert("x-tunnel-timestamp", v);
    }

    response
}

fn is_dropped_response_header(name: &HeaderName) -> bool {
    // The body is already decoded and re-framed
    name == header::CONTENT_ENCODING
        || name == header::TRANSFER_ENCODING
        || name == header::CONTENT_LENGTH
        || HOP_BY_HOP.contains(&name.as_str())
}
