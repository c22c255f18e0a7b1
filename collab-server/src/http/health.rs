//! Health check endpoint.

use crate::gateway::CollabGateway;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `ok`, `degraded` (cross-instance sync suspended) or `draining`.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Instance id.
    pub instance: String,
    /// `local` or `distributed`.
    pub sync_mode: String,
    /// Number of attached connections.
    pub connections: usize,
    /// Number of documents in memory.
    pub documents: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Snapshot of a gateway.
    pub fn of(gateway: &CollabGateway) -> Self {
        let status = if !gateway.is_accepting() {
            "draining"
        } else if gateway.is_degraded() {
            "degraded"
        } else {
            "ok"
        };
        Self {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance: gateway.instance().to_string(),
            sync_mode: gateway.mode().to_string(),
            connections: gateway.connection_count(),
            documents: gateway.document_count(),
            uptime_seconds: gateway.uptime().as_secs(),
        }
    }
}

/// Health check handler.
pub async fn health_handler(Extension(gateway): Extension<Arc<CollabGateway>>) -> Json<HealthStatus> {
    Json(HealthStatus::of(&gateway))
}
