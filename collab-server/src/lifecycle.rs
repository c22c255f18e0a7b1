//! Graceful shutdown.
//!
//! Draining stops new connections, asks every client to leave, and waits
//! for them up to a grace period. Clients that have not left by then are
//! detached forcibly. Every document with unsaved changes is then written
//! once, documents held open by server code included.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::adapter::CloseReason;
use crate::router::ConnectionRouter;

/// What a drain did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Documents loaded when the drain started.
    pub documents: usize,
    /// Connections sent a close frame.
    pub closed_connections: usize,
    /// Connections detached after the grace period ran out.
    pub forced_connections: usize,
    /// Documents whose final write failed.
    pub unflushed_documents: usize,
    /// Time the drain took.
    pub elapsed: Duration,
}

/// Drives instance shutdown.
#[derive(Debug)]
pub struct ShutdownController {
    router: Arc<ConnectionRouter>,
    grace: Duration,
}

impl ShutdownController {
    /// Controller for the instance behind `router`.
    pub fn new(router: Arc<ConnectionRouter>, grace: Duration) -> Self {
        Self { router, grace }
    }

    /// Stop accepting, close every connection and persist every dirty
    /// document. Coordinator background work is stopped last.
    pub async fn drain(&self) -> DrainReport {
        let started = Instant::now();
        self.router.stop_accepting();
        let coordinator = self.router.coordinator();
        let engine = coordinator.engine();

        let documents = engine.document_count();
        let mut closed_connections = 0;
        let mut forced_connections = 0;
        if engine.connection_count() > 0 {
            closed_connections = engine.close_connections(CloseReason::going_away());
            info!(documents, connections = closed_connections, "Draining");

            let mut connections = engine.watch_connections();
            if tokio::time::timeout(self.grace, connections.wait_for(|n| *n == 0))
                .await
                .is_err()
            {
                forced_connections = engine.force_detach_all().await;
                warn!(
                    forced = forced_connections,
                    grace = ?self.grace,
                    "Connections did not close in time, detached"
                );
            }
        } else if documents > 0 {
            info!(documents, "Draining with no connections");
        }

        let unflushed_documents = engine.flush_all().await;
        if unflushed_documents > 0 {
            warn!(documents = unflushed_documents, "Documents not persisted at shutdown");
        }

        coordinator.shutdown().await;
        let report = DrainReport {
            documents,
            closed_connections,
            forced_connections,
            unflushed_documents,
            elapsed: started.elapsed(),
        };
        info!(elapsed = ?report.elapsed, "Drain complete");
        report
    }
}
