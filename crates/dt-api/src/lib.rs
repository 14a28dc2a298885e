pub mod error;
pub mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use state::ApiState;
use std::any::Any;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

pub use error::ApiError;

/// Build the complete API router with all `/api/*` routes.
///
/// Every response carries permissive CORS headers. `OPTIONS` requests are
/// answered by the CORS layer and never reach a route, so they are never
/// forwarded to a device. A panicking handler becomes a 500 JSON payload.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn api_routes() -> Router<ApiState> {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::targets::router())
        .merge(routes::discovery::router())
        .merge(routes::status::router())
        .merge(routes::resolver::router())
        .merge(routes::proxy::router())
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": "not-found", "message": "Unknown route"})),
    )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    error!("Request handler panicked: {}", detail);
    ApiError::Internal(detail).into_response()
}
