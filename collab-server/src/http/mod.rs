//! HTTP endpoints for collab-server.
//!
//! Serves the WebSocket route clients connect to, plus health and metrics.

pub mod health;
mod metrics;
mod ws;

use crate::config::Config;
use crate::gateway::CollabGateway;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(gateway: Arc<CollabGateway>, config: &Config) -> Router {
    let ws_route = format!("{}/:document", config.server.path_prefix.trim_end_matches('/'));
    let mut router = Router::new()
        .route("/health", get(health::health_handler))
        .route(&ws_route, get(ws::ws_handler));
    if config.http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(gateway))
}
