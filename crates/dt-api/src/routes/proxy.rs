use axum::{
    extract::{ConnectInfo, Request, State},
    http::Uri,
    response::Response,
    routing::any,
    Router,
};
use std::net::SocketAddr;

use crate::error::ApiError;
use crate::state::ApiState;

const MOUNT: &str = "/proxy";

pub fn router() -> Router<ApiState> {
    Router::new()
        .route(MOUNT, any(proxy))
        .route("/proxy/{*path}", any(proxy))
}

async fn proxy(State(state): State<ApiState>, mut req: Request) -> Result<Response, ApiError> {
    // Absent when served without connect info (tests, unix sockets)
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let relative = strip_mount(req.uri(), MOUNT)?;
    *req.uri_mut() = relative;
    Ok(state.forwarder.forward(client_ip, req).await)
}

/// `/proxy/files?x=1` → `/files?x=1`
fn strip_mount(uri: &Uri, mount: &str) -> Result<Uri, ApiError> {
    let path = uri.path().strip_prefix(mount).unwrap_or(uri.path());
    let path = if path.is_empty() { "/" } else { path };
    let path_and_query = match uri.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };
    Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ApiError::MalformedInput(format!("invalid request URI: {}", e)))
}
