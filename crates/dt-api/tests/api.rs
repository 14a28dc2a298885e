use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use axum::routing::{any, get};
use axum::{Json, Router};
use dt_api::build_router;
use dt_api::state::ApiState;
use dt_common::{Credentials, DiscoveryConfig, Registry, Settings, TargetCandidate};
use dt_probe::{Confidence, HttpProber, ProbeError, ProbeMode, ProbeResult, Prober};
use dt_proxy::OptionalAccessLogger;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Answers from a fixed url → status table; anything else times out.
#[derive(Default)]
struct StubProber {
    statuses: HashMap<String, u16>,
    calls: AtomicUsize,
}

impl StubProber {
    fn with(entries: &[(&str, u16)]) -> Self {
        Self {
            statuses: entries.iter().map(|(u, s)| (u.to_string(), *s)).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Prober for StubProber {
    fn probe<'a>(
        &'a self,
        target: &'a TargetCandidate,
        _credentials: &'a Credentials,
        _timeout: Duration,
        _mode: ProbeMode,
    ) -> BoxFuture<'a, ProbeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.statuses.get(target.as_str()) {
            Some(&status) => {
                let confidence = if status == 200 { Confidence::High } else { Confidence::Medium };
                ProbeResult::responded(target.clone(), status, 7, confidence, None)
            }
            None => ProbeResult::failed(target.clone(), 0, ProbeError::timeout(Duration::from_millis(50))),
        };
        async move { result }.boxed()
    }
}

fn candidates(urls: &[&str]) -> Vec<TargetCandidate> {
    urls.iter().map(|u| TargetCandidate::new(*u).unwrap()).collect()
}

fn app_with(urls: &[&str], prober: Arc<dyn Prober>) -> (Router, ApiState) {
    let registry = Arc::new(Registry::new(candidates(urls), Credentials::default(), Settings::default()));
    let state = ApiState::new(registry, prober, DiscoveryConfig::default(), OptionalAccessLogger::none()).unwrap();
    (build_router(state.clone()), state)
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

async fn call_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = call(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::ORIGIN, "http://localhost:3000")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app_with(&[], Arc::new(StubProber::default()));
    let (status, body) = call_json(&app, get_request("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_options_answered_without_forwarding() {
    let prober = Arc::new(StubProber::with(&[("http://10.9.9.9:8080", 200)]));
    let (app, _) = app_with(&["http://10.9.9.9:8080"], prober.clone());

    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/proxy/files/upload")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = call(&app, req).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cors_header_on_regular_responses() {
    let (app, _) = app_with(&[], Arc::new(StubProber::default()));
    let (_, headers, _) = call(&app, get_request("/api/targets")).await;
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_add_target_requires_target() {
    let (app, _) = app_with(&[], Arc::new(StubProber::default()));

    let (status, body) = call_json(&app, json_request(Method::PUT, "/api/targets", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed-input");

    let (status, body) = call_json(&app, json_request(Method::PUT, "/api/targets", json!({"target": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed-input");

    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/api/targets")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_add_is_idempotent() {
    let (app, state) = app_with(&["http://10.0.0.5:8080"], Arc::new(StubProber::default()));

    let put = || json_request(Method::PUT, "/api/targets", json!({"target": "http://10.0.0.6:2121"}));
    let (_, first) = call_json(&app, put()).await;
    let (_, second) = call_json(&app, put()).await;

    assert_eq!(first["added"], true);
    assert_eq!(second["added"], false);
    assert_eq!(second["targets"], json!(["http://10.0.0.5:8080", "http://10.0.0.6:2121"]));
    assert_eq!(state.registry.list().await.len(), 2);
}

#[tokio::test]
async fn test_remove_clears_pin() {
    let (app, state) = app_with(&["http://a:1", "http://b:2"], Arc::new(StubProber::default()));

    let (status, _) = call_json(&app, json_request(Method::POST, "/api/targets", json!({"activeTarget": "http://b:2"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.registry.active().await.unwrap().as_str(), "http://b:2");

    let (_, body) = call_json(&app, json_request(Method::DELETE, "/api/targets", json!({"target": "http://b:2"}))).await;
    assert_eq!(body["removed"], true);
    assert_eq!(body["targets"], json!(["http://a:1"]));
    assert!(state.registry.active().await.is_none());

    let (_, body) = call_json(&app, json_request(Method::DELETE, "/api/targets", json!({"target": "http://z:9"}))).await;
    assert_eq!(body["removed"], false);
}

#[tokio::test]
async fn test_update_merges_without_echoing_password() {
    let (app, state) = app_with(&["http://a:1"], Arc::new(StubProber::default()));

    let update = json!({
        "credentials": {"username": "pixel", "password": "s3cret"},
        "settings": {"checkIntervalMs": 5000}
    });
    let (status, body) = call_json(&app, json_request(Method::POST, "/api/targets", update)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["registry"]["username"], "pixel");
    assert_eq!(body["registry"]["settings"]["checkIntervalMs"], 5000);
    assert_eq!(body["registry"]["settings"]["timeoutMs"], 10000);
    assert!(!body.to_string().contains("s3cret"));
    assert_eq!(state.registry.credentials().await.password, "s3cret");
}

#[tokio::test]
async fn test_status_report() {
    let prober = Arc::new(StubProber::with(&[("http://a:1", 200)]));
    let (app, _) = app_with(&["http://a:1", "http://b:2"], prober);

    let (status, body) = call_json(&app, get_request("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["total"], 2);
    assert_eq!(body["summary"]["online"], 1);
    assert_eq!(body["summary"]["recommended"], "http://a:1");
    assert_eq!(body["targets"][1]["reachable"], false);
    assert!(!body["hints"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_discovery_apply_adds_found_targets() {
    let prober = Arc::new(StubProber::with(&[("http://10.1.1.2:8080", 200), ("http://10.1.1.3:8080", 401)]));
    let (app, state) = app_with(&[], prober.clone());

    let scan = json!({
        "prefixes": ["10.1.1"],
        "ports": [8080],
        "hosts": [1, 2, 3, 4],
        "batchSize": 2,
        "apply": true
    });
    let (status, body) = call_json(&app, json_request(Method::POST, "/api/discovery", scan)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["totalTested"], 4);
    assert_eq!(body["report"]["primary"]["target"], "http://10.1.1.2:8080");
    assert_eq!(body["applied"], json!(["http://10.1.1.2:8080", "http://10.1.1.3:8080"]));
    assert_eq!(prober.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        state.registry.list().await,
        candidates(&["http://10.1.1.2:8080", "http://10.1.1.3:8080"])
    );
}

#[tokio::test]
async fn test_discovery_rejects_zero_batch() {
    let (app, _) = app_with(&[], Arc::new(StubProber::default()));
    let (status, body) = call_json(&app, json_request(Method::POST, "/api/discovery", json!({"batchSize": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed-input");
}

#[tokio::test]
async fn test_discovery_rejects_oversized_range() {
    let prober = Arc::new(StubProber::default());
    let (app, _) = app_with(&[], prober.clone());

    let prefixes: Vec<String> = (0..64).map(|i| format!("10.0.{}", i)).collect();
    let ports: Vec<u16> = (8000..8064).collect();
    let scan = json!({"prefixes": prefixes, "ports": ports, "hosts": [1, 2]});
    let (status, body) = call_json(&app, json_request(Method::POST, "/api/discovery", scan)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed-input");
    assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_proxy_without_targets_is_503() {
    let prober = Arc::new(StubProber::default());
    let (app, _) = app_with(&[], prober.clone());

    let (status, headers, body) = call(&app, get_request("/api/proxy/files")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "no-target");
    assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolver_cache_and_invalidate() {
    let prober = Arc::new(StubProber::with(&[("http://a:1", 200)]));
    let (app, state) = app_with(&["http://a:1"], prober);

    let (_, body) = call_json(&app, get_request("/api/resolver")).await;
    assert!(body["active"].is_null());

    state.resolver.resolve().await;
    let (_, body) = call_json(&app, get_request("/api/resolver")).await;
    assert_eq!(body["active"]["target"], "http://a:1");
    assert_eq!(body["active"]["fresh"], true);

    let req = Request::builder().method(Method::DELETE).uri("/api/resolver").body(Body::empty()).unwrap();
    let (status, _) = call_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.resolver.cached().await.is_none());
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let (app, _) = app_with(&[], Arc::new(StubProber::default()));
    let (status, body) = call_json(&app, get_request("/api/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not-found");
}

#[tokio::test]
async fn test_proxy_end_to_end() {
    async fn echo(method: Method, uri: Uri, headers: HeaderMap) -> Json<Value> {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string());
        Json(json!({
            "method": method.as_str(),
            "uri": uri.to_string(),
            "originalUrl": text("x-original-url"),
            "forwardedFor": text("x-forwarded-for"),
        }))
    }
    let device = Router::new()
        .route("/", get(|| async { StatusCode::OK }))
        .route("/echo", any(echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, device).await.unwrap();
    });

    let target = format!("http://{}", addr);
    let (app, _) = app_with(&[target.as_str()], Arc::new(HttpProber::new().unwrap()));

    let (status, headers, body) = call(&app, get_request("/api/proxy/echo?x=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-tunnel-target"], target.as_str());

    let seen: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(seen["method"], "GET");
    assert_eq!(seen["uri"], "/echo?x=1");
    assert_eq!(seen["originalUrl"], "/api/proxy/echo?x=1");
    assert_eq!(seen["forwardedFor"], "unknown");
}
