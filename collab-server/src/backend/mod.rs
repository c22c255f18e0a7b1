//! Shared pub/sub + lease backend.
//!
//! Instances coordinate through one shared backend: a channel per document
//! for cross-instance events, and expiring leases for document locks.
//! [`RedisBackend`] is what deployed instances share. [`MemoryHub`] is the
//! in-process implementation for tests; every simulated instance gets its
//! own [`MemoryBackend`] client on the same hub.

mod memory;
mod redis;

pub use self::memory::{MemoryBackend, MemoryHub};
pub use self::redis::RedisBackend;

use crate::error::BackendResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// A lease this client holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    /// Lease key, e.g. `collab:lock:page.42`.
    pub key: String,
    /// Random owner token.
    pub value: String,
}

impl LeaseToken {
    /// Fresh token for `key`.
    pub fn generate(key: impl Into<String>) -> Self {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self {
            key: key.into(),
            value: hex::encode(bytes),
        }
    }
}

/// Trait for shared backends.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Publish a payload to every subscriber of `channel`, this client included.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BackendResult<()>;

    /// Subscribe to `channel`. Subscribing again replaces the previous
    /// subscription; the old receiver ends.
    ///
    /// The receiver also ends if the backend drops the subscription.
    async fn subscribe(&self, channel: &str) -> BackendResult<mpsc::UnboundedReceiver<Vec<u8>>>;

    /// Stop receiving from `channel`.
    async fn unsubscribe(&self, channel: &str) -> BackendResult<()>;

    /// Take the lease on `key` unless someone else holds it.
    async fn acquire_lease(&self, key: &str, ttl: Duration) -> BackendResult<LeaseToken>;

    /// Extend a held lease.
    async fn renew_lease(&self, lease: &LeaseToken, ttl: Duration) -> BackendResult<()>;

    /// Give a lease up. Releasing a lease that already lapsed is not an error.
    async fn release_lease(&self, lease: &LeaseToken) -> BackendResult<()>;

    /// Check the backend is reachable.
    async fn ping(&self) -> BackendResult<()>;
}
