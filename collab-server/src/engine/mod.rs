//! Document session engine.
//!
//! Holds one CRDT document per loaded name, attaches client connections to
//! it, applies their updates, and fans changes out to the other viewers.
//! Interested parties (the cross-instance coordinator) follow along through
//! [`EngineEvent`]s.
//!
//! ## Lifecycle
//!
//! ```text
//! attach ──► load from storage ──► Loaded
//!   │
//!   ├── client/remote/direct updates ──► Updated ──► debounced persistence
//!   │
//! last viewer leaves ──► flush ──► still idle and clean? ──► Unloaded
//! ```
//!
//! A session is flushed while it is still attachable and only marked closed
//! if it is idle and clean after the flush. An attacher that finds a closed
//! session retries and gets a fresh one loaded from storage. A failed write
//! keeps the session loaded and dirty; the persistence task retries and
//! unloads it once the write goes through.

mod direct;
pub mod protocol;
mod session;

pub use direct::DirectSession;
pub use session::DEFAULT_FRAGMENT;

use collab_core::DebouncePolicy;
use collab_types::{ConnectionId, DocumentName};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use yrs::updates::decoder::Decode;
use yrs::{Transact, Update};

use crate::adapter::{CloseReason, RawConnection, SocketAdapter, SocketEvent};
use crate::config::Config;
use crate::error::{EngineError, EngineResult, StorageResult};
use crate::handshake::Handshake;
use crate::metrics::GatewayMetrics;
use crate::storage::DocumentStorage;
use protocol::ClientFrame;
use session::DocumentSession;

/// Close code sent to connections that stop answering pings.
const KEEPALIVE_CLOSE_CODE: u16 = 1011;

/// Engine timings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Persistence debounce.
    pub debounce: DebouncePolicy,
    /// Delay before retrying a failed write.
    pub retry_delay: Duration,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: DebouncePolicy::default(),
            retry_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce_policy(),
            retry_delay: config.retry_delay(),
            ping_interval: config.ping_interval(),
        }
    }
}

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A client of this instance or a direct session.
    Local,
    /// A sibling instance.
    Remote,
}

/// Engine notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Document was loaded from storage.
    Loaded {
        /// Document.
        document: DocumentName,
    },
    /// Document changed.
    Updated {
        /// Document.
        document: DocumentName,
        /// The delta, v1 update encoding.
        update: Vec<u8>,
        /// Where it came from.
        origin: UpdateOrigin,
    },
    /// A local client sent a presence frame.
    Awareness {
        /// Document.
        document: DocumentName,
        /// Raw y-protocol frame.
        frame: Vec<u8>,
    },
    /// Document was persisted and dropped from memory.
    Unloaded {
        /// Document.
        document: DocumentName,
    },
}

struct AttachedConnection {
    document: DocumentName,
    socket: Arc<SocketAdapter>,
    keepalive: JoinHandle<()>,
}

/// The document session engine.
pub struct DocumentEngine {
    storage: Arc<dyn DocumentStorage>,
    config: EngineConfig,
    metrics: Arc<GatewayMetrics>,
    documents: DashMap<DocumentName, Arc<DocumentSession>>,
    connections: DashMap<ConnectionId, AttachedConnection>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
    document_count: watch::Sender<usize>,
    /// Attached plus detaching connections.
    connection_count: watch::Sender<usize>,
}

impl std::fmt::Debug for DocumentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentEngine")
            .field("config", &self.config)
            .field("documents", &self.documents.len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl DocumentEngine {
    /// Create an engine over the given storage.
    pub fn new(
        storage: Arc<dyn DocumentStorage>,
        config: EngineConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Arc<Self> {
        let (document_count, _) = watch::channel(0);
        let (connection_count, _) = watch::channel(0);
        Arc::new(Self {
            storage,
            config,
            metrics,
            documents: DashMap::new(),
            connections: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            document_count,
            connection_count,
        })
    }

    /// Follow engine events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Attach a connection to a document, loading it if needed.
    ///
    /// The connection immediately receives a sync step 1 with the document's
    /// state vector.
    pub async fn attach(
        self: &Arc<Self>,
        socket: Arc<SocketAdapter>,
        document: &DocumentName,
    ) -> EngineResult<()> {
        let id = socket.id().clone();
        if self.connections.contains_key(&id) {
            return Err(EngineError::DuplicateConnection {
                connection: id.to_string(),
            });
        }

        let step1 = loop {
            let session = self.session_for(document);
            self.ensure_loaded(&session).await?;
            let attached = {
                let mut state = session.lock();
                if state.closed {
                    None
                } else {
                    state.viewers.insert(id.clone(), Arc::clone(&socket));
                    Some(protocol::sync_step1(state.state_vector()))
                }
            };
            match attached {
                Some(step1) => break step1,
                None => tokio::task::yield_now().await,
            }
        };

        let keepalive = tokio::spawn(keepalive(
            Arc::downgrade(self),
            Arc::clone(&socket),
            self.config.ping_interval,
        ));
        self.connections.insert(
            id.clone(),
            AttachedConnection {
                document: document.clone(),
                socket: Arc::clone(&socket),
                keepalive,
            },
        );
        self.connection_count.send_modify(|n| *n += 1);
        GatewayMetrics::incr(&self.metrics.connections_total);

        let _ = socket.send(step1);
        debug!(document = %document, connection = ?id, "Connection attached");
        Ok(())
    }

    /// Handle one client frame.
    ///
    /// Errors concern this frame only; the connection stays open.
    pub fn receive(self: &Arc<Self>, connection: &ConnectionId, bytes: &[u8]) -> EngineResult<()> {
        GatewayMetrics::incr(&self.metrics.messages_total);
        let result = self.dispatch(connection, bytes);
        if result.is_err() {
            GatewayMetrics::incr(&self.metrics.malformed_messages);
        }
        result
    }

    fn dispatch(self: &Arc<Self>, connection: &ConnectionId, bytes: &[u8]) -> EngineResult<()> {
        let unknown = || EngineError::UnknownConnection {
            connection: connection.to_string(),
        };
        let document = self
            .connections
            .get(connection)
            .map(|c| c.document.clone())
            .ok_or_else(unknown)?;
        let session = self.loaded_session(&document).ok_or_else(unknown)?;

        match protocol::decode(bytes)? {
            ClientFrame::SyncStep1(state_vector) => {
                let (diff, socket) = {
                    let state = session.lock();
                    (
                        state.encode_diff(&state_vector),
                        state.viewers.get(connection).cloned(),
                    )
                };
                if let Some(socket) = socket {
                    let _ = socket.send(protocol::sync_step2(diff));
                }
                Ok(())
            }
            ClientFrame::Update(update) => self.apply_client_update(&session, connection, update),
            ClientFrame::Awareness => {
                let peers = session.lock().viewers_except(Some(connection));
                for peer in peers {
                    let _ = peer.send(bytes.to_vec());
                }
                self.emit(EngineEvent::Awareness {
                    document,
                    frame: bytes.to_vec(),
                });
                Ok(())
            }
            ClientFrame::Ignored(kind) => {
                debug!(document = %document, kind, "Ignoring client message");
                Ok(())
            }
        }
    }

    fn apply_client_update(
        self: &Arc<Self>,
        session: &Arc<DocumentSession>,
        from: &ConnectionId,
        update: Vec<u8>,
    ) -> EngineResult<()> {
        let decoded = decode_update(&session.name, &update)?;
        let peers = {
            let mut state = session.lock();
            state
                .doc
                .transact_mut()
                .apply_update(decoded)
                .map_err(|e| EngineError::InvalidUpdate {
                    document: session.name.clone(),
                    reason: e.to_string(),
                })?;
            state.mark_changed(now());
            state.viewers_except(Some(from))
        };
        self.publish_change(session, update, peers, UpdateOrigin::Local);
        Ok(())
    }

    /// Apply an update that arrived from a sibling instance.
    ///
    /// Returns `false` without touching anything if the document is not
    /// loaded here.
    pub fn apply_remote_update(
        self: &Arc<Self>,
        document: &DocumentName,
        update: &[u8],
    ) -> EngineResult<bool> {
        let Some(session) = self.loaded_session(document) else {
            return Ok(false);
        };
        let decoded = decode_update(document, update)?;
        let peers = {
            let mut state = session.lock();
            if state.closed {
                return Ok(false);
            }
            state
                .doc
                .transact_mut()
                .apply_update(decoded)
                .map_err(|e| EngineError::InvalidUpdate {
                    document: document.clone(),
                    reason: e.to_string(),
                })?;
            state.mark_changed(now());
            state.viewers_except(None)
        };
        self.publish_change(&session, update.to_vec(), peers, UpdateOrigin::Remote);
        Ok(true)
    }

    /// Fan a change out to viewers and subscribers and schedule persistence.
    pub(crate) fn publish_change(
        self: &Arc<Self>,
        session: &Arc<DocumentSession>,
        update: Vec<u8>,
        viewers: Vec<Arc<SocketAdapter>>,
        origin: UpdateOrigin,
    ) {
        if !viewers.is_empty() {
            let frame = protocol::update(update.clone());
            for viewer in viewers {
                let _ = viewer.send(frame.clone());
            }
        }
        self.emit(EngineEvent::Updated {
            document: session.name.clone(),
            update,
            origin,
        });
        self.schedule_persistence(session);
    }

    /// Relay a presence frame to every local viewer of a loaded document.
    pub fn broadcast_awareness(&self, document: &DocumentName, frame: &[u8]) -> usize {
        self.send_to_viewers(document, frame)
    }

    /// Deliver a stateless payload to every local viewer.
    pub fn send_stateless(&self, document: &DocumentName, payload: &str) -> usize {
        self.send_to_viewers(document, &protocol::stateless(payload))
    }

    fn send_to_viewers(&self, document: &DocumentName, frame: &[u8]) -> usize {
        let Some(session) = self.loaded_session(document) else {
            return 0;
        };
        let viewers = session.lock().viewers_except(None);
        viewers
            .iter()
            .filter(|viewer| viewer.send(frame.to_vec()).is_ok())
            .count()
    }

    /// Close every local connection of one document.
    pub fn close_document_connections(&self, document: &DocumentName, reason: CloseReason) -> usize {
        let Some(session) = self.loaded_session(document) else {
            return 0;
        };
        let viewers = session.lock().viewers_except(None);
        for viewer in &viewers {
            viewer.close(reason.clone());
        }
        viewers.len()
    }

    /// Diff a peer at `state_vector` is missing, `None` if not loaded here.
    pub fn encode_diff(
        &self,
        document: &DocumentName,
        state_vector: &[u8],
    ) -> EngineResult<Option<Vec<u8>>> {
        let Some(session) = self.loaded_session(document) else {
            return Ok(None);
        };
        let state_vector = protocol::decode_state_vector(state_vector)?;
        let diff = session.lock().encode_diff(&state_vector);
        Ok(Some(diff))
    }

    /// Encoded state vector of a loaded document.
    pub fn state_vector(&self, document: &DocumentName) -> Option<Vec<u8>> {
        self.loaded_session(document)
            .map(|session| session.lock().encoded_state_vector())
    }

    /// Full state of a loaded document as one update.
    pub fn encode_state(&self, document: &DocumentName) -> Option<Vec<u8>> {
        self.loaded_session(document)
            .map(|session| session.lock().encode_state())
    }

    /// XML of the default fragment of a loaded document.
    pub fn read_content(&self, document: &DocumentName) -> Option<String> {
        self.loaded_session(document)
            .map(|session| session.lock().content_xml())
    }

    /// Open a connection-less session, loading the document if needed.
    pub async fn open_direct(self: &Arc<Self>, document: &DocumentName) -> EngineResult<DirectSession> {
        loop {
            let session = self.session_for(document);
            self.ensure_loaded(&session).await?;
            let opened = {
                let mut state = session.lock();
                if state.closed {
                    false
                } else {
                    state.direct += 1;
                    true
                }
            };
            if opened {
                return Ok(DirectSession::new(Arc::clone(self), session));
            }
            tokio::task::yield_now().await;
        }
    }

    /// Open a connection-less session only if the document is loaded and
    /// not closing.
    pub fn open_direct_if_loaded(self: &Arc<Self>, document: &DocumentName) -> Option<DirectSession> {
        let session = self.loaded_session(document)?;
        {
            let mut state = session.lock();
            if state.closed {
                return None;
            }
            state.direct += 1;
        }
        Some(DirectSession::new(Arc::clone(self), session))
    }

    /// True if the document is loaded and not closing.
    pub fn is_loaded(&self, document: &DocumentName) -> bool {
        self.loaded_session(document)
            .is_some_and(|session| !session.lock().closed)
    }

    /// True if a session for the document exists in any phase, loading and
    /// closing included.
    pub fn has_document(&self, document: &DocumentName) -> bool {
        self.documents.contains_key(document)
    }

    /// Detach a connection. If it was the last viewer, the document is
    /// flushed and unloaded before this returns.
    pub async fn detach(self: &Arc<Self>, connection: &ConnectionId) -> Option<DocumentName> {
        let (_, attached) = self.connections.remove(connection)?;
        attached.keepalive.abort();

        let session = self
            .documents
            .get(&attached.document)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(session) = session {
            let idle = {
                let mut state = session.lock();
                state.viewers.remove(connection);
                state.is_idle()
            };
            debug!(document = %attached.document, connection = ?connection, "Connection detached");
            if idle {
                self.try_unload(&session).await;
            }
        }
        self.connection_count.send_modify(|n| *n = n.saturating_sub(1));
        Some(attached.document)
    }

    /// Own a raw connection end to end (local mode).
    ///
    /// Attaches, feeds every inbound event to the engine, and detaches when
    /// the client closes or the transport ends.
    pub async fn handle_connection(self: &Arc<Self>, raw: RawConnection, handshake: Handshake) {
        let RawConnection {
            mut events,
            outbound,
        } = raw;
        let socket = Arc::new(SocketAdapter::new(handshake.connection_id.clone(), outbound));

        if let Err(e) = self.attach(Arc::clone(&socket), &handshake.document).await {
            warn!(document = %handshake.document, error = %e, "Failed to attach connection");
            socket.close(CloseReason::new(1011, e.to_string()));
            return;
        }

        let mut close = None;
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Message(bytes) => {
                    if let Err(e) = self.receive(socket.id(), &bytes) {
                        debug!(document = %handshake.document, error = %e, "Dropping client frame");
                    }
                }
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
        self.detach(socket.id()).await;
        debug!(document = %handshake.document, code = reason.code, "Connection closed");
    }

    /// Send a close frame to every attached connection.
    pub fn close_connections(&self, reason: CloseReason) -> usize {
        let sockets: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(&entry.socket))
            .collect();
        for socket in &sockets {
            socket.close(reason.clone());
        }
        sockets.len()
    }

    /// Detach every connection without waiting for the clients.
    pub async fn force_detach_all(self: &Arc<Self>) -> usize {
        let ids: Vec<_> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        let mut detached = 0;
        for id in ids {
            if self.detach(&id).await.is_some() {
                detached += 1;
            }
        }
        detached
    }

    /// Attached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Follow the number of connections attached or still detaching. A
    /// detach counts until the unload it triggered has finished.
    pub fn watch_connections(&self) -> watch::Receiver<usize> {
        self.connection_count.subscribe()
    }

    /// Persist every loaded document with unsaved changes now, without
    /// waiting for its debounce. Returns how many writes failed.
    pub async fn flush_all(self: &Arc<Self>) -> usize {
        let sessions: Vec<_> = self
            .documents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut failed = 0;
        for session in sessions.iter().filter(|session| session.is_loaded()) {
            if self.flush(session).await.is_err() {
                failed += 1;
            }
        }
        failed
    }

    /// Documents in memory, loading and closing ones included.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Follow the document count.
    pub fn watch_documents(&self) -> watch::Receiver<usize> {
        self.document_count.subscribe()
    }

    /// Names of loaded documents that are not closing.
    pub fn loaded_documents(&self) -> Vec<DocumentName> {
        let sessions: Vec<_> = self
            .documents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions
            .into_iter()
            .filter(|session| session.is_loaded() && !session.lock().closed)
            .map(|session| session.name.clone())
            .collect()
    }

    /// Engine metrics.
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    // --- sessions -------------------------------------------------------

    fn session_for(&self, document: &DocumentName) -> Arc<DocumentSession> {
        let session = self
            .documents
            .entry(document.clone())
            .or_insert_with(|| Arc::new(DocumentSession::new(document.clone())))
            .clone();
        self.document_count.send_replace(self.documents.len());
        session
    }

    fn loaded_session(&self, document: &DocumentName) -> Option<Arc<DocumentSession>> {
        self.documents
            .get(document)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| session.is_loaded())
    }

    async fn ensure_loaded(&self, session: &Arc<DocumentSession>) -> EngineResult<()> {
        let result = session
            .loaded
            .get_or_try_init(|| async {
                let snapshot = self
                    .storage
                    .read(&session.name)
                    .await
                    .map_err(|source| EngineError::Load {
                        document: session.name.clone(),
                        source,
                    })?;
                if let Some(snapshot) = snapshot {
                    let update = decode_update(&session.name, &snapshot)?;
                    let state = session.lock();
                    state
                        .doc
                        .transact_mut()
                        .apply_update(update)
                        .map_err(|e| EngineError::InvalidUpdate {
                            document: session.name.clone(),
                            reason: e.to_string(),
                        })?;
                }
                info!(document = %session.name, "Document loaded");
                self.emit(EngineEvent::Loaded {
                    document: session.name.clone(),
                });
                Ok::<(), EngineError>(())
            })
            .await;

        if let Err(e) = result {
            error!(document = %session.name, error = %e, "Failed to load document");
            self.documents.remove_if(&session.name, |_, existing| {
                Arc::ptr_eq(existing, session) && existing.lock().is_idle()
            });
            self.document_count.send_replace(self.documents.len());
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn schedule_persistence(self: &Arc<Self>, session: &Arc<DocumentSession>) {
        {
            let mut state = session.lock();
            if state.persist_scheduled || !state.debounce.is_dirty() {
                return;
            }
            state.persist_scheduled = true;
        }
        let engine = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move { engine.run_persistence(session).await });
    }

    async fn run_persistence(self: Arc<Self>, session: Arc<DocumentSession>) {
        let policy = self.config.debounce;
        loop {
            let due = {
                let mut state = session.lock();
                match state.debounce.due_at(&policy) {
                    Some(due) => due,
                    None => {
                        state.persist_scheduled = false;
                        return;
                    }
                }
            };
            tokio::time::sleep_until(tokio::time::Instant::from_std(due)).await;

            if !session.lock().debounce.is_due(&policy, now()) {
                continue;
            }
            if self.flush(&session).await.is_ok() && session.lock().is_idle() {
                self.try_unload(&session).await;
            }
        }
    }

    /// Write the document if dirty. Returns whether anything was written.
    async fn flush(self: &Arc<Self>, session: &Arc<DocumentSession>) -> StorageResult<bool> {
        let _guard = session.flush_lock.lock().await;
        let (generation, snapshot) = {
            let state = session.lock();
            if !state.debounce.is_dirty() {
                return Ok(false);
            }
            (state.debounce.begin_flush(), state.encode_state())
        };

        match self.storage.write(&session.name, &snapshot).await {
            Ok(()) => {
                session.lock().debounce.complete_flush(generation);
                GatewayMetrics::incr(&self.metrics.persist_total);
                debug!(document = %session.name, bytes = snapshot.len(), "Document persisted");
                Ok(true)
            }
            Err(e) => {
                session
                    .lock()
                    .debounce
                    .fail_flush(now(), self.config.retry_delay);
                GatewayMetrics::incr(&self.metrics.persist_failures);
                error!(document = %session.name, error = %e, "Failed to persist document");
                self.schedule_persistence(session);
                Err(e)
            }
        }
    }

    /// Flush and unload an idle session.
    pub(crate) async fn try_unload(self: &Arc<Self>, session: &Arc<DocumentSession>) {
        loop {
            {
                let state = session.lock();
                if state.closed || !state.is_idle() {
                    return;
                }
            }
            if self.flush(session).await.is_err() {
                return;
            }
            let closed = {
                let mut state = session.lock();
                if state.closed || !state.is_idle() {
                    return;
                }
                if state.debounce.is_dirty() {
                    false
                } else {
                    state.closed = true;
                    true
                }
            };
            if closed {
                break;
            }
        }

        self.documents
            .remove_if(&session.name, |_, existing| Arc::ptr_eq(existing, session));
        self.document_count.send_replace(self.documents.len());
        info!(document = %session.name, "Document unloaded");
        self.emit(EngineEvent::Unloaded {
            document: session.name.clone(),
        });
    }

    /// A direct session ended.
    pub(crate) async fn release_direct(self: &Arc<Self>, session: &Arc<DocumentSession>) {
        let idle = {
            let mut state = session.lock();
            state.direct = state.direct.saturating_sub(1);
            state.is_idle()
        };
        if idle {
            self.try_unload(session).await;
        }
    }

    fn emit(&self, event: EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn decode_update(document: &DocumentName, bytes: &[u8]) -> EngineResult<Update> {
    Update::decode_v1(bytes).map_err(|e| EngineError::InvalidUpdate {
        document: document.clone(),
        reason: e.to_string(),
    })
}

/// Current time on the runtime clock (paused in tests).
pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Ping on an interval; close and detach a connection that misses a pong.
async fn keepalive(engine: Weak<DocumentEngine>, socket: Arc<SocketAdapter>, interval: Duration) {
    let mut events = socket.subscribe();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if awaiting_pong {
                    warn!(connection = ?socket.id(), "Keepalive timed out");
                    socket.close(CloseReason::new(KEEPALIVE_CLOSE_CODE, "keepalive timeout"));
                    if let Some(engine) = engine.upgrade() {
                        GatewayMetrics::incr(&engine.metrics.keepalive_timeouts);
                        let id = socket.id().clone();
                        // Detach from a fresh task: detach aborts this one.
                        tokio::spawn(async move {
                            engine.detach(&id).await;
                        });
                    }
                    return;
                }
                if socket.ping().is_err() {
                    return;
                }
                awaiting_pong = true;
            }
            event = events.recv() => match event {
                Ok(SocketEvent::Pong(_)) => awaiting_pong = false,
                Ok(SocketEvent::Close(_)) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(SocketEvent::Message(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}
