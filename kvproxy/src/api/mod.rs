//! HTTP surface of the proxy.
//!
//! The proxy exposes the backend's completion endpoints plus model
//! discovery, a model-scoped slot inspection pass-through, and a couple of
//! operational routes.

pub mod routes;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/completions", post(routes::completions))
        .route("/v1/models", get(routes::models))
        .route("/models/:model/slots", get(routes::list_slots))
        .route("/health", get(routes::health))
        .route("/stats/cache", get(routes::cache_stats))
        .with_state(state)
        .layer(CorsLayer::new())
        .layer(TraceLayer::new_for_http())
}
