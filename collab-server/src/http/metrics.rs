//! Prometheus metrics endpoint.

use crate::gateway::CollabGateway;
use crate::metrics::GatewayMetrics;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(gateway): Extension<Arc<CollabGateway>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&gateway),
    )
}

fn render(gateway: &CollabGateway) -> String {
    let m = gateway.metrics();
    let get = GatewayMetrics::get;

    // Gauges: current state
    let connections = gateway.connection_count();
    let documents = gateway.document_count();
    let degraded = u8::from(gateway.is_degraded());

    format!(
        r#"# HELP collab_connections_active Number of attached connections
# TYPE collab_connections_active gauge
collab_connections_active {connections}

# HELP collab_documents_loaded Number of documents in memory
# TYPE collab_documents_loaded gauge
collab_documents_loaded {documents}

# HELP collab_sync_degraded Whether cross-instance sync is suspended
# TYPE collab_sync_degraded gauge
collab_sync_degraded {degraded}

# HELP collab_info Server information
# TYPE collab_info gauge
collab_info{{version="{version}",instance="{instance}",mode="{mode}"}} 1

# HELP collab_connections_total Total connections attached
# TYPE collab_connections_total counter
collab_connections_total {connections_total}

# HELP collab_connections_rejected_total Total connections rejected
# TYPE collab_connections_rejected_total counter
collab_connections_rejected_total {rejected}

# HELP collab_messages_total Total client frames received
# TYPE collab_messages_total counter
collab_messages_total {messages}

# HELP collab_malformed_messages_total Total client frames dropped as malformed
# TYPE collab_malformed_messages_total counter
collab_malformed_messages_total {malformed}

# HELP collab_updates_published_total Total updates published to sibling instances
# TYPE collab_updates_published_total counter
collab_updates_published_total {published}

# HELP collab_remote_updates_applied_total Total sibling updates applied
# TYPE collab_remote_updates_applied_total counter
collab_remote_updates_applied_total {applied}

# HELP collab_remote_updates_dropped_total Total sibling updates dropped
# TYPE collab_remote_updates_dropped_total counter
collab_remote_updates_dropped_total {dropped}

# HELP collab_persist_total Total document writes
# TYPE collab_persist_total counter
collab_persist_total {persisted}

# HELP collab_persist_failures_total Total failed document writes
# TYPE collab_persist_failures_total counter
collab_persist_failures_total {persist_failures}

# HELP collab_backend_errors_total Total failed backend calls
# TYPE collab_backend_errors_total counter
collab_backend_errors_total {backend_errors}

# HELP collab_lock_losses_total Total document locks lost while held
# TYPE collab_lock_losses_total counter
collab_lock_losses_total {lock_losses}

# HELP collab_keepalive_timeouts_total Total connections closed for missing a pong
# TYPE collab_keepalive_timeouts_total counter
collab_keepalive_timeouts_total {keepalive_timeouts}
"#,
        version = env!("CARGO_PKG_VERSION"),
        instance = gateway.instance(),
        mode = gateway.mode(),
        connections_total = get(&m.connections_total),
        rejected = get(&m.connections_rejected),
        messages = get(&m.messages_total),
        malformed = get(&m.malformed_messages),
        published = get(&m.updates_published),
        applied = get(&m.remote_updates_applied),
        dropped = get(&m.remote_updates_dropped),
        persisted = get(&m.persist_total),
        persist_failures = get(&m.persist_failures),
        backend_errors = get(&m.backend_errors),
        lock_losses = get(&m.lock_losses),
        keepalive_timeouts = get(&m.keepalive_timeouts),
    )
}
