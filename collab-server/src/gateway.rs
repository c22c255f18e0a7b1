//! The collaboration gateway.
//!
//! Wires storage, engine, coordinator, router, content replacement and
//! shutdown together and is the administrative surface the rest of the
//! application talks to.

use collab_types::{CustomEvent, DocumentName, InstanceId};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adapter::RawConnection;
use crate::backend::SyncBackend;
use crate::config::Config;
use crate::content::{ContentReplacer, ProseMirrorConverter};
use crate::coordinator::{
    Coordinator, CoordinatorConfig, DistributedCoordinator, LocalCoordinator, LockWatch, SyncMode,
};
use crate::engine::{DirectSession, DocumentEngine, EngineConfig};
use crate::error::{ConnectionError, LockError, Result};
use crate::handshake::HandshakeRequest;
use crate::lifecycle::{DrainReport, ShutdownController};
use crate::metrics::GatewayMetrics;
use crate::router::{ConnectionRouter, RoutedConnection};
use crate::storage::DocumentStorage;

/// One collaboration server instance.
#[derive(Debug)]
pub struct CollabGateway {
    instance: InstanceId,
    engine: Arc<DocumentEngine>,
    router: Arc<ConnectionRouter>,
    replacer: ContentReplacer,
    shutdown: ShutdownController,
    started: Instant,
}

impl CollabGateway {
    /// Build an instance.
    ///
    /// Cross-instance sync runs when `config.sync.enabled` is set and a
    /// backend is given; otherwise the instance runs alone. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        config: &Config,
        instance: InstanceId,
        storage: Arc<dyn DocumentStorage>,
        backend: Option<Arc<dyn SyncBackend>>,
    ) -> Self {
        let metrics = Arc::new(GatewayMetrics::default());
        let engine = DocumentEngine::new(storage, EngineConfig::from(config), metrics);
        let coordinator_config = CoordinatorConfig::from(config);

        let coordinator: Arc<dyn Coordinator> = match backend {
            Some(backend) if config.sync.enabled => Arc::new(DistributedCoordinator::new(
                instance.clone(),
                Arc::clone(&engine),
                backend,
                coordinator_config,
            )),
            _ => Arc::new(LocalCoordinator::new(Arc::clone(&engine), coordinator_config)),
        };
        info!(instance = %instance, mode = %coordinator.mode(), "Collaboration gateway created");

        let router = Arc::new(ConnectionRouter::new(coordinator));
        Self {
            replacer: ContentReplacer::new(Arc::clone(&engine), Arc::new(ProseMirrorConverter)),
            shutdown: ShutdownController::new(Arc::clone(&router), config.shutdown_grace()),
            instance,
            engine,
            router,
            started: Instant::now(),
        }
    }

    /// Instance id.
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Coordination strategy in use.
    pub fn mode(&self) -> SyncMode {
        self.coordinator().mode()
    }

    /// True while cross-instance sync is suspended.
    pub fn is_degraded(&self) -> bool {
        self.coordinator().is_degraded()
    }

    /// False once draining started.
    pub fn is_accepting(&self) -> bool {
        self.router.is_accepting()
    }

    /// The document engine.
    pub fn engine(&self) -> &Arc<DocumentEngine> {
        &self.engine
    }

    /// Operational counters.
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        self.engine.metrics()
    }

    /// Time since the instance was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Attached connections.
    pub fn connection_count(&self) -> usize {
        self.engine.connection_count()
    }

    /// Documents in memory.
    pub fn document_count(&self) -> usize {
        self.engine.document_count()
    }

    /// Validate and route a raw connection.
    pub fn route(
        &self,
        raw: RawConnection,
        request: &HandshakeRequest,
    ) -> std::result::Result<RoutedConnection, ConnectionError> {
        self.router.route(raw, request)
    }

    /// Route and serve a raw connection until it closes.
    pub async fn serve_connection(&self, raw: RawConnection, request: HandshakeRequest) {
        self.router.serve(raw, request).await;
    }

    /// Replace the content of a document if it is loaded on this instance.
    /// See [`ContentReplacer::replace`].
    pub async fn replace_document_content(
        &self,
        document: &DocumentName,
        content: &Value,
    ) -> Result<bool> {
        self.replacer.replace(document, content).await
    }

    /// Replace the content of a document under its lock, whether or not it
    /// is loaded.
    ///
    /// Returns whether live viewers on this instance got the change; when
    /// nobody views it here the new content is merged into the stored state.
    /// Fails with [`LockError::Expired`] if the lease was lost before the
    /// write, or before it could be given back.
    pub async fn replace_or_store(&self, document: &DocumentName, content: &Value) -> Result<bool> {
        let lock = self.lock_document(document).await?;
        let result = self.replacer.replace_locked(document, content, &lock).await;
        match (result, self.release_lock(document).await) {
            (Err(e), released) => {
                if let Err(release) = released {
                    debug!(document = %document, error = %release, "Lock release after failed replace");
                }
                Err(e)
            }
            (Ok(_), Err(e @ LockError::Expired { .. })) => {
                warn!(document = %document, "Document lock lost during replace");
                Err(e.into())
            }
            (Ok(live), Err(e)) => {
                warn!(document = %document, error = %e, "Failed to release document lock");
                Ok(live)
            }
            (Ok(live), Ok(())) => Ok(live),
        }
    }

    /// Take the document lock and keep renewing it until released.
    pub async fn lock_document(
        &self,
        document: &DocumentName,
    ) -> std::result::Result<LockWatch, LockError> {
        self.coordinator().lock_document(document).await
    }

    /// Release the document lock.
    pub async fn release_lock(&self, document: &DocumentName) -> std::result::Result<(), LockError> {
        self.coordinator().release_lock(document).await
    }

    /// Apply a custom event here and on every sibling instance.
    pub async fn handle_event(&self, document: &DocumentName, event: CustomEvent) -> Result<()> {
        self.coordinator().handle_event(document, event).await
    }

    /// Open a connection-less session on a document, loading it if needed.
    pub async fn open_direct_connection(&self, document: &DocumentName) -> Result<DirectSession> {
        Ok(self.engine.open_direct(document).await?)
    }

    /// Drain the instance. See [`ShutdownController::drain`].
    pub async fn drain(&self) -> DrainReport {
        self.shutdown.drain().await
    }

    fn coordinator(&self) -> &Arc<dyn Coordinator> {
        self.router.coordinator()
    }
}
