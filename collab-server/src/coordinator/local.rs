//! Single-instance coordination.

use async_trait::async_trait;
use collab_types::{ConnectionId, CustomEvent, DocumentName};
use std::sync::Arc;
use tracing::debug;

use super::{apply_custom_event, Coordinator, CoordinatorConfig, LockManager, LockState, LockWatch, SyncMode};
use crate::adapter::{CloseReason, SocketAdapter};
use crate::backend::MemoryHub;
use crate::engine::DocumentEngine;
use crate::error::{CollabError, ConnectionError, LockError};
use crate::handshake::Handshake;

/// Coordinator for a lone instance. Nothing is published anywhere.
#[derive(Debug)]
pub struct LocalCoordinator {
    engine: Arc<DocumentEngine>,
    locks: LockManager,
}

impl LocalCoordinator {
    /// Locks are kept in a private in-process lease table.
    pub fn new(engine: Arc<DocumentEngine>, config: CoordinatorConfig) -> Self {
        let metrics = Arc::clone(engine.metrics());
        let locks = LockManager::new(
            Arc::new(MemoryHub::new().client()),
            config.prefix,
            config.lease,
            metrics,
        );
        Self { engine, locks }
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    fn mode(&self) -> SyncMode {
        SyncMode::Local
    }

    fn engine(&self) -> &Arc<DocumentEngine> {
        &self.engine
    }

    async fn on_open(
        &self,
        socket: Arc<SocketAdapter>,
        handshake: &Handshake,
    ) -> Result<(), ConnectionError> {
        self.engine.attach(socket, &handshake.document).await?;
        Ok(())
    }

    fn on_message(&self, socket: &SocketAdapter, handshake: &Handshake, bytes: &[u8]) {
        if let Err(e) = self.engine.receive(socket.id(), bytes) {
            debug!(document = %handshake.document, error = %e, "Dropping client frame");
        }
    }

    async fn on_close(&self, connection: &ConnectionId, _close: &CloseReason) {
        self.engine.detach(connection).await;
    }

    async fn handle_event(
        &self,
        document: &DocumentName,
        event: CustomEvent,
    ) -> Result<(), CollabError> {
        let delivered = apply_custom_event(&self.engine, document, &event);
        debug!(document = %document, kind = ?collab_types::SyncEvent::Custom(event).kind(), delivered, "Custom event applied");
        Ok(())
    }

    async fn lock_document(&self, document: &DocumentName) -> Result<LockWatch, LockError> {
        self.locks.lock(document).await
    }

    async fn release_lock(&self, document: &DocumentName) -> Result<(), LockError> {
        self.locks.release(document).await
    }

    fn lock_state(&self, document: &DocumentName) -> Option<LockState> {
        self.locks.state(document)
    }

    async fn shutdown(&self) {
        self.locks.release_all().await;
    }
}
