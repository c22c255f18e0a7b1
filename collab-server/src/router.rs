//! Connection routing.
//!
//! Validates the upgrade handshake and decides who owns a raw connection:
//! in local mode the engine consumes the raw events itself, in distributed
//! mode the router wraps the connection in a [`SocketAdapter`] and forwards
//! each event exactly once to the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapter::{CloseReason, OutboundFrame, RawConnection, SocketAdapter, SocketEvent};
use crate::coordinator::{Coordinator, SyncMode};
use crate::engine::DocumentEngine;
use crate::error::ConnectionError;
use crate::handshake::{Handshake, HandshakeRequest};
use crate::metrics::GatewayMetrics;

/// Routes validated connections to the engine or the coordinator.
pub struct ConnectionRouter {
    coordinator: Arc<dyn Coordinator>,
    accepting: AtomicBool,
}

impl std::fmt::Debug for ConnectionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRouter")
            .field("mode", &self.coordinator.mode())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl ConnectionRouter {
    /// Create a router in front of `coordinator`.
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            accepting: AtomicBool::new(true),
        }
    }

    /// Coordinator connections are routed to.
    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Refuse new connections from now on.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// False once draining started.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Validate `request` and decide who owns `raw`.
    ///
    /// A rejected connection is sent a close frame right away; the error
    /// concerns this connection only.
    pub fn route(
        &self,
        raw: RawConnection,
        request: &HandshakeRequest,
    ) -> Result<RoutedConnection, ConnectionError> {
        if !self.is_accepting() {
            return Err(self.reject(&raw, ConnectionError::ShuttingDown));
        }
        let handshake = match request.validate() {
            Ok(handshake) => handshake,
            Err(e) => return Err(self.reject(&raw, e)),
        };

        debug!(
            document = %handshake.document,
            connection = ?handshake.connection_id,
            remote = ?handshake.remote_address,
            mode = %self.coordinator.mode(),
            "Routing connection"
        );
        Ok(match self.coordinator.mode() {
            SyncMode::Local => RoutedConnection::Direct(DirectConnection {
                engine: Arc::clone(self.coordinator.engine()),
                raw,
                handshake,
            }),
            SyncMode::Distributed => {
                let RawConnection { events, outbound } = raw;
                let socket = Arc::new(SocketAdapter::new(handshake.connection_id.clone(), outbound));
                RoutedConnection::Coordinated(CoordinatedConnection {
                    coordinator: Arc::clone(&self.coordinator),
                    socket,
                    events,
                    handshake,
                })
            }
        })
    }

    /// Route and run a connection to completion.
    pub async fn serve(&self, raw: RawConnection, request: HandshakeRequest) {
        if let Ok(connection) = self.route(raw, &request) {
            connection.run().await;
        }
    }

    fn reject(&self, raw: &RawConnection, error: ConnectionError) -> ConnectionError {
        GatewayMetrics::incr(&self.coordinator.engine().metrics().connections_rejected);
        warn!(error = %error, "Rejecting connection");
        let _ = raw.outbound.send(OutboundFrame::Close(CloseReason::new(
            error.close_code(),
            error.to_string(),
        )));
        error
    }
}

/// Who owns a routed connection.
#[derive(Debug)]
pub enum RoutedConnection {
    /// The engine reads the raw events itself.
    Direct(DirectConnection),
    /// The router forwards raw events to the coordinator.
    Coordinated(CoordinatedConnection),
}

impl RoutedConnection {
    /// Document the connection is for.
    pub fn handshake(&self) -> &Handshake {
        match self {
            RoutedConnection::Direct(connection) => &connection.handshake,
            RoutedConnection::Coordinated(connection) => &connection.handshake,
        }
    }

    /// Serve the connection until it closes.
    pub async fn run(self) {
        match self {
            RoutedConnection::Direct(connection) => connection.run().await,
            RoutedConnection::Coordinated(connection) => connection.run().await,
        }
    }
}

/// Connection owned by the engine.
#[derive(Debug)]
pub struct DirectConnection {
    engine: Arc<DocumentEngine>,
    raw: RawConnection,
    handshake: Handshake,
}

impl DirectConnection {
    /// Serve the connection until it closes.
    pub async fn run(self) {
        self.engine.handle_connection(self.raw, self.handshake).await;
    }
}

/// Connection whose events the router forwards to the coordinator.
pub struct CoordinatedConnection {
    coordinator: Arc<dyn Coordinator>,
    socket: Arc<SocketAdapter>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    handshake: Handshake,
}

impl std::fmt::Debug for CoordinatedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatedConnection")
            .field("socket", &self.socket)
            .field("handshake", &self.handshake)
            .finish_non_exhaustive()
    }
}

impl CoordinatedConnection {
    /// Serve the connection until it closes.
    pub async fn run(mut self) {
        let coordinator = &self.coordinator;
        let socket = &self.socket;
        let handshake = &self.handshake;

        if let Err(e) = coordinator.on_open(Arc::clone(socket), handshake).await {
            warn!(document = %handshake.document, error = %e, "Failed to open connection");
            socket.close(CloseReason::new(e.close_code(), e.to_string()));
            return;
        }

        let mut close = None;
        while let Some(event) = self.events.recv().await {
            match event {
                SocketEvent::Message(bytes) => coordinator.on_message(socket, handshake, &bytes),
                SocketEvent::Pong(payload) => {
                    socket.emit(SocketEvent::Pong(payload));
                }
                SocketEvent::Close(reason) => {
                    close = Some(reason);
                    break;
                }
            }
        }

        let reason = close.unwrap_or_else(CloseReason::abnormal);
        socket.emit(SocketEvent::Close(reason.clone()));
        coordinator.on_close(socket.id(), &reason).await;
        debug!(document = %handshake.document, code = reason.code, "Connection closed");
    }
}
