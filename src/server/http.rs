//! HTTP front-end: routing, CORS and health.

use axum::extract::State;
use axum::http::{header, Method};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{dispatch, AppState};

/// Build the front-end router. Health is answered locally; every other
/// path and method goes to the dispatcher.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(dispatch::proxy_handler)
        .with_state(state)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Permissive CORS: the local client is typically a browser app served
/// from an arbitrary origin. Preflights short-circuit with 200.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "browserConnected": state.binding.is_connected(),
        "pendingRequests": state.table.len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
