//! Operational counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational metrics for monitoring collaboration activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Counters are `AtomicU64`s and can be bumped from any task.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Connections attached to a document.
    pub connections_total: AtomicU64,
    /// Connections rejected at the handshake or during drain.
    pub connections_rejected: AtomicU64,
    /// Client frames received.
    pub messages_total: AtomicU64,
    /// Client frames that failed to decode or apply.
    pub malformed_messages: AtomicU64,
    /// Local updates published to sibling instances.
    pub updates_published: AtomicU64,
    /// Remote updates applied to a loaded document.
    pub remote_updates_applied: AtomicU64,
    /// Remote updates dropped because the document was not loaded here.
    pub remote_updates_dropped: AtomicU64,
    /// Successful document writes.
    pub persist_total: AtomicU64,
    /// Failed document writes.
    pub persist_failures: AtomicU64,
    /// Failed backend calls.
    pub backend_errors: AtomicU64,
    /// Document locks that expired while held.
    pub lock_losses: AtomicU64,
    /// Connections closed for missing a keepalive pong.
    pub keepalive_timeouts: AtomicU64,
}

impl GatewayMetrics {
    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
