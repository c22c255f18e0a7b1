//! Multi-instance coordination over a shared backend.
//!
//! Every loaded document is subscribed to `{prefix}:doc:{name}`. An engine
//! event pump publishes local deltas and presence frames; one delivery task
//! per channel applies what siblings publish. Backend failures degrade the
//! link (see [`collab_core::LinkState`]): local viewers keep working,
//! publishes are skipped, and a supervisor pings the backend with
//! exponential backoff. On recovery every loaded document is resubscribed and
//! republished in full so instances that diverged converge again.

use async_trait::async_trait;
use collab_core::{LinkAction, LinkEvent, LinkNotice, LinkState, ReconnectPolicy};
use collab_types::{
    ConnectionId, CustomEvent, DocumentName, EventKind, InstanceId, SyncEvent, SyncMessage,
};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    apply_custom_event, Coordinator, CoordinatorConfig, LockManager, LockState, LockWatch, SyncMode,
};
use crate::adapter::{CloseReason, SocketAdapter};
use crate::backend::SyncBackend;
use crate::engine::protocol::EMPTY_UPDATE;
use crate::engine::{DocumentEngine, EngineEvent, UpdateOrigin};
use crate::error::{BackendError, BackendResult, CollabError, ConnectionError, LockError};
use crate::handshake::Handshake;
use crate::metrics::GatewayMetrics;

/// Coordinator for instances sharing a [`SyncBackend`].
#[derive(Debug)]
pub struct DistributedCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    instance: InstanceId,
    prefix: String,
    engine: Arc<DocumentEngine>,
    backend: Arc<dyn SyncBackend>,
    locks: LockManager,
    metrics: Arc<GatewayMetrics>,
    reconnect: ReconnectPolicy,
    link: Mutex<LinkState>,
    /// Delivery task per subscribed channel.
    subscriptions: DashMap<DocumentName, JoinHandle<()>>,
    /// Serializes subscribe and unsubscribe calls.
    subscribe_lock: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("instance", &self.instance)
            .field("prefix", &self.prefix)
            .field("link", &*self.link())
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl DistributedCoordinator {
    /// Start coordinating `engine` through `backend` as `instance`.
    ///
    /// Must be called inside a Tokio runtime: the engine event pump starts
    /// immediately.
    pub fn new(
        instance: InstanceId,
        engine: Arc<DocumentEngine>,
        backend: Arc<dyn SyncBackend>,
        config: CoordinatorConfig,
    ) -> Self {
        let metrics = Arc::clone(engine.metrics());
        let locks = LockManager::new(
            Arc::clone(&backend),
            config.prefix.clone(),
            config.lease,
            Arc::clone(&metrics),
        );
        let events = engine.subscribe();
        let inner = Arc::new(Inner {
            instance,
            prefix: config.prefix,
            engine,
            backend,
            locks,
            metrics,
            reconnect: config.reconnect,
            link: Mutex::new(LinkState::new()),
            subscriptions: DashMap::new(),
            subscribe_lock: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(pump(Arc::downgrade(&inner), events));
        *inner.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);
        info!(instance = %inner.instance, prefix = %inner.prefix, "Distributed sync enabled");
        Self { inner }
    }

    /// This instance's id.
    pub fn instance(&self) -> &InstanceId {
        &self.inner.instance
    }

    /// Channel name of a document.
    pub fn channel(&self, document: &DocumentName) -> String {
        self.inner.channel(document)
    }

    /// Current backend link state.
    pub fn link_state(&self) -> LinkState {
        self.inner.link().clone()
    }

    /// True if a delivery task is running for the document's channel.
    pub fn is_subscribed(&self, document: &DocumentName) -> bool {
        self.inner
            .subscriptions
            .get(document)
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl Coordinator for DistributedCoordinator {
    fn mode(&self) -> SyncMode {
        SyncMode::Distributed
    }

    fn engine(&self) -> &Arc<DocumentEngine> {
        &self.inner.engine
    }

    async fn on_open(
        &self,
        socket: Arc<SocketAdapter>,
        handshake: &Handshake,
    ) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let document = &handshake.document;
        if let Err(e) = inner.ensure_subscribed(document).await {
            debug!(document = %document, error = %e, "Opening without cross-instance subscription");
        }
        if let Err(e) = inner.engine.attach(socket, document).await {
            // No session was left behind, so the channel has no reader.
            inner.unsubscribe(document).await;
            return Err(e.into());
        }
        if let Some(state_vector) = inner.engine.state_vector(document) {
            inner
                .publish(document, SyncEvent::SyncStep1(state_vector))
                .await;
        }
        Ok(())
    }

    fn on_message(&self, socket: &SocketAdapter, handshake: &Handshake, bytes: &[u8]) {
        if let Err(e) = self.inner.engine.receive(socket.id(), bytes) {
            debug!(document = %handshake.document, error = %e, "Dropping client frame");
        }
    }

    async fn on_close(&self, connection: &ConnectionId, close: &CloseReason) {
        if let Some(document) = self.inner.engine.detach(connection).await {
            debug!(document = %document, code = close.code, "Coordinated connection closed");
        }
    }

    async fn handle_event(
        &self,
        document: &DocumentName,
        event: CustomEvent,
    ) -> Result<(), CollabError> {
        let delivered = apply_custom_event(&self.inner.engine, document, &event);
        debug!(document = %document, delivered, "Custom event applied locally");
        self.inner.publish(document, SyncEvent::Custom(event)).await;
        Ok(())
    }

    async fn lock_document(&self, document: &DocumentName) -> Result<LockWatch, LockError> {
        let result = self.inner.locks.lock(document).await;
        if let Err(LockError::Backend(e @ BackendError::Unavailable { .. })) = &result {
            self.inner.backend_failed(e);
        }
        result
    }

    async fn release_lock(&self, document: &DocumentName) -> Result<(), LockError> {
        let result = self.inner.locks.release(document).await;
        if let Err(LockError::Backend(e @ BackendError::Unavailable { .. })) = &result {
            self.inner.backend_failed(e);
        }
        result
    }

    fn lock_state(&self, document: &DocumentName) -> Option<LockState> {
        self.inner.locks.state(document)
    }

    fn is_degraded(&self) -> bool {
        !self.inner.link().is_connected()
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        if let Some(pump) = inner.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
        let documents: Vec<_> = inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for document in documents {
            if let Some((_, task)) = inner.subscriptions.remove(&document) {
                task.abort();
            }
            let _ = inner.backend.unsubscribe(&inner.channel(&document)).await;
        }
        inner.locks.release_all().await;
        info!(instance = %inner.instance, "Distributed sync stopped");
    }
}

impl Inner {
    fn channel(&self, document: &DocumentName) -> String {
        format!("{}:doc:{}", self.prefix, document)
    }

    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe unless a live delivery task exists. Returns whether a new
    /// subscription was made.
    async fn ensure_subscribed(self: &Arc<Self>, document: &DocumentName) -> BackendResult<bool> {
        let _guard = self.subscribe_lock.lock().await;
        if self
            .subscriptions
            .get(document)
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(false);
        }
        self.subscribe(document).await.map(|()| true)
    }

    /// (Re)subscribe a channel. Caller holds `subscribe_lock`.
    async fn subscribe(self: &Arc<Self>, document: &DocumentName) -> BackendResult<()> {
        // Abort first so the old task never sees its receiver end.
        if let Some((_, old)) = self.subscriptions.remove(document) {
            old.abort();
        }
        let channel = self.channel(document);
        let messages = match self.backend.subscribe(&channel).await {
            Ok(messages) => messages,
            Err(e) => {
                self.backend_failed(&e);
                return Err(e);
            }
        };
        let task = tokio::spawn(deliver_loop(
            Arc::downgrade(self),
            document.clone(),
            messages,
        ));
        self.subscriptions.insert(document.clone(), task);
        debug!(document = %document, channel = %channel, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(self: &Arc<Self>, document: &DocumentName) {
        let _guard = self.subscribe_lock.lock().await;
        // Reloaded since the unload was reported.
        if self.engine.has_document(document) {
            return;
        }
        let Some((_, task)) = self.subscriptions.remove(document) else {
            return;
        };
        task.abort();
        let channel = self.channel(document);
        match self.backend.unsubscribe(&channel).await {
            Ok(()) => debug!(document = %document, channel = %channel, "Unsubscribed"),
            Err(e) => self.backend_failed(&e),
        }
    }

    /// Publish an event for a document. Skipped while the link is degraded.
    async fn publish(self: &Arc<Self>, document: &DocumentName, event: SyncEvent) -> bool {
        if !self.link().is_connected() {
            debug!(document = %document, kind = ?event.kind(), "Link degraded, not publishing");
            return false;
        }
        let kind = event.kind();
        let bytes = match SyncMessage::new(document.clone(), event, self.instance.clone()).to_bytes()
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(document = %document, error = %e, "Failed to encode sync message");
                return false;
            }
        };
        match self.backend.publish(&self.channel(document), bytes).await {
            Ok(()) => {
                if kind == EventKind::Update {
                    GatewayMetrics::incr(&self.metrics.updates_published);
                }
                true
            }
            Err(e) => {
                self.backend_failed(&e);
                false
            }
        }
    }

    /// Handle one envelope from the backend.
    async fn deliver(self: &Arc<Self>, payload: &[u8]) {
        let message = match SyncMessage::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable sync message");
                return;
            }
        };
        if message.is_from(&self.instance) {
            return;
        }
        let SyncMessage {
            document,
            event,
            origin,
            ..
        } = message;

        match event {
            SyncEvent::Update(update) => {
                match self.engine.apply_remote_update(&document, &update) {
                    Ok(true) => GatewayMetrics::incr(&self.metrics.remote_updates_applied),
                    Ok(false) => {
                        GatewayMetrics::incr(&self.metrics.remote_updates_dropped);
                        debug!(document = %document, origin = %origin, "Dropping update for unloaded document");
                    }
                    Err(e) => {
                        GatewayMetrics::incr(&self.metrics.remote_updates_dropped);
                        warn!(document = %document, origin = %origin, error = %e, "Rejected remote update");
                    }
                }
            }
            SyncEvent::Awareness(frame) => {
                self.engine.broadcast_awareness(&document, &frame);
            }
            SyncEvent::SyncStep1(state_vector) => {
                match self.engine.encode_diff(&document, &state_vector) {
                    Ok(Some(diff)) if diff != EMPTY_UPDATE => {
                        self.publish(&document, SyncEvent::Update(diff)).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(document = %document, origin = %origin, error = %e, "Bad state vector from sibling")
                    }
                }
            }
            SyncEvent::Custom(event) => {
                let delivered = apply_custom_event(&self.engine, &document, &event);
                debug!(document = %document, origin = %origin, delivered, "Custom event delivered");
            }
        }
    }

    fn backend_failed(self: &Arc<Self>, error: &BackendError) {
        GatewayMetrics::incr(&self.metrics.backend_errors);
        self.link_event(LinkEvent::OperationFailed {
            error: error.to_string(),
        });
    }

    /// Drive the link state machine and run the actions it asks for.
    fn link_event(self: &Arc<Self>, event: LinkEvent) {
        let actions = {
            let mut link = self.link();
            let (next, actions) = link.clone().on_event(event);
            *link = next;
            actions
        };

        let mut resync = false;
        for action in actions {
            match action {
                LinkAction::StartReconnectTimer { attempt } => {
                    let delay = self.reconnect.delay(attempt);
                    let inner = Arc::downgrade(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let Some(inner) = inner.upgrade() else {
                            return;
                        };
                        let event = match inner.backend.ping().await {
                            Ok(()) => LinkEvent::ProbeSucceeded,
                            Err(e) => LinkEvent::ProbeFailed {
                                error: e.to_string(),
                            },
                        };
                        inner.link_event(event);
                    });
                }
                LinkAction::Resubscribe | LinkAction::Republish => resync = true,
                LinkAction::Emit(LinkNotice::Degraded { error }) => {
                    warn!(instance = %self.instance, error = %error, "Backend link degraded, serving local viewers only");
                }
                LinkAction::Emit(LinkNotice::ProbeFailed { attempt, error }) => {
                    debug!(instance = %self.instance, attempt, error = %error, "Backend ping failed");
                }
                LinkAction::Emit(LinkNotice::Restored { attempts }) => {
                    info!(instance = %self.instance, attempts, "Backend link restored");
                }
            }
        }

        if resync {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.resync().await });
        }
    }

    /// Resubscribe every loaded document, then publish its full state and a
    /// state vector so siblings send back what this instance missed.
    async fn resync(self: &Arc<Self>) {
        let documents = self.engine.loaded_documents();
        for document in &documents {
            let _guard = self.subscribe_lock.lock().await;
            if self.subscribe(document).await.is_err() {
                return;
            }
        }
        for document in &documents {
            if let Some(state) = self.engine.encode_state(document) {
                self.publish(document, SyncEvent::Update(state)).await;
            }
            if let Some(state_vector) = self.engine.state_vector(document) {
                self.publish(document, SyncEvent::SyncStep1(state_vector))
                    .await;
            }
        }
        info!(instance = %self.instance, documents = documents.len(), "Documents resynchronized");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        for entry in self.subscriptions.iter() {
            entry.value().abort();
        }
    }
}

/// Forward engine events to the backend.
async fn pump(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            EngineEvent::Loaded { document } => match inner.ensure_subscribed(&document).await {
                Ok(true) => {
                    if let Some(state_vector) = inner.engine.state_vector(&document) {
                        inner
                            .publish(&document, SyncEvent::SyncStep1(state_vector))
                            .await;
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(document = %document, error = %e, "Subscribe on load failed"),
            },
            EngineEvent::Updated {
                document,
                update,
                origin: UpdateOrigin::Local,
            } => {
                inner.publish(&document, SyncEvent::Update(update)).await;
            }
            EngineEvent::Updated {
                origin: UpdateOrigin::Remote,
                ..
            } => {}
            EngineEvent::Awareness { document, frame } => {
                inner.publish(&document, SyncEvent::Awareness(frame)).await;
            }
            EngineEvent::Unloaded { document } => inner.unsubscribe(&document).await,
        }
    }
}

/// Apply everything published on one document channel.
async fn deliver_loop(
    inner: Weak<Inner>,
    document: DocumentName,
    mut messages: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(payload) = messages.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.deliver(&payload).await;
    }
    // Unsubscribing aborts this task first, so getting here means the
    // backend dropped the subscription.
    if let Some(inner) = inner.upgrade() {
        warn!(document = %document, "Subscription dropped by backend");
        inner.backend_failed(&BackendError::Unavailable {
            reason: format!("subscription to {} closed", inner.channel(&document)),
        });
    }
}
