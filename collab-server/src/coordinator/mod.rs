//! Cross-instance sync coordination.
//!
//! A [`Coordinator`] sits between the router and the [`DocumentEngine`].
//! Which implementation runs is decided once at startup:
//!
//! - [`LocalCoordinator`]: single instance. Connections go straight to the
//!   engine; locks live in an in-process lease table.
//! - [`DistributedCoordinator`]: instances share a [`SyncBackend`]. Local
//!   changes are published on a per-document channel and sibling changes are
//!   applied to locally loaded documents.

mod distributed;
mod local;
mod lock;

pub use distributed::DistributedCoordinator;
pub use local::LocalCoordinator;
pub use lock::{LockManager, LockState, LockWatch};

use async_trait::async_trait;
use collab_core::{LeaseTiming, ReconnectPolicy};
use collab_types::{ConnectionId, CustomEvent, DocumentName};
use std::fmt;
use std::sync::Arc;

use crate::adapter::{CloseReason, SocketAdapter};
use crate::config::Config;
use crate::engine::DocumentEngine;
use crate::error::{CollabError, ConnectionError, LockError};
use crate::handshake::Handshake;

#[cfg(doc)]
use crate::backend::SyncBackend;

/// Close code for viewers disconnected by a force-reload event.
pub const FORCE_RELOAD_CLOSE_CODE: u16 = 4000;

/// Which coordination strategy is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Single instance.
    Local,
    /// Instances share a backend.
    Distributed,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Local => write!(f, "local"),
            SyncMode::Distributed => write!(f, "distributed"),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Prefix of channel and lock keys.
    pub prefix: String,
    /// Lock lease timings.
    pub lease: LeaseTiming,
    /// Backend reconnect backoff.
    pub reconnect: ReconnectPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prefix: "collab".into(),
            lease: LeaseTiming::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&Config> for CoordinatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            prefix: config.sync.prefix.clone(),
            lease: config.lease_timing(),
            reconnect: config.reconnect_policy(),
        }
    }
}

/// Cross-instance coordination strategy.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Strategy in use.
    fn mode(&self) -> SyncMode;

    /// Engine this coordinator drives.
    fn engine(&self) -> &Arc<DocumentEngine>;

    /// A connection opened on a document.
    async fn on_open(
        &self,
        socket: Arc<SocketAdapter>,
        handshake: &Handshake,
    ) -> Result<(), ConnectionError>;

    /// A client frame arrived. Errors concern that frame only and are logged.
    fn on_message(&self, socket: &SocketAdapter, handshake: &Handshake, bytes: &[u8]);

    /// A connection closed. Returns once the document is unloaded if this was
    /// its last viewer.
    async fn on_close(&self, connection: &ConnectionId, close: &CloseReason);

    /// Apply a custom event locally and forward it to sibling instances.
    async fn handle_event(
        &self,
        document: &DocumentName,
        event: CustomEvent,
    ) -> Result<(), CollabError>;

    /// Take the document lock and keep renewing it.
    async fn lock_document(&self, document: &DocumentName) -> Result<LockWatch, LockError>;

    /// Stop renewing and release the document lock.
    async fn release_lock(&self, document: &DocumentName) -> Result<(), LockError>;

    /// State of a lock this instance holds or held.
    fn lock_state(&self, document: &DocumentName) -> Option<LockState>;

    /// True while cross-instance sync is suspended.
    fn is_degraded(&self) -> bool {
        false
    }

    /// Stop background work. Held locks are released.
    async fn shutdown(&self);
}

/// Apply a custom event to the local viewers of a document.
pub(crate) fn apply_custom_event(
    engine: &DocumentEngine,
    document: &DocumentName,
    event: &CustomEvent,
) -> usize {
    match event {
        CustomEvent::ForceReload { reason } => engine.close_document_connections(
            document,
            CloseReason::new(
                FORCE_RELOAD_CLOSE_CODE,
                reason.clone().unwrap_or_else(|| "reload".into()),
            ),
        ),
        CustomEvent::Stateless { payload } => engine.send_stateless(document, payload),
    }
}
