//! Cluster harness: gateways over a shared hub plus fake Yjs clients.
//!
//! Every node is a full [`CollabGateway`] with its own engine and
//! coordinator. Nodes share one [`MemoryHub`] (pub/sub channels and leases)
//! and one [`MemoryStorage`], so a document unloaded on one node loads with
//! the same state on another.

use collab_server::adapter::{CloseReason, OutboundFrame, RawConnection, SocketEvent};
use collab_server::backend::{MemoryBackend, MemoryHub, SyncBackend};
use collab_server::config::Config;
use collab_server::engine::protocol;
use collab_server::engine::DEFAULT_FRAGMENT;
use collab_server::gateway::CollabGateway;
use collab_server::handshake::HandshakeRequest;
use collab_server::storage::MemoryStorage;
use collab_types::{DocumentName, InstanceId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

/// Errors that can occur while driving the cluster.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Condition not reached in time.
    #[error("timeout waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
    },

    /// Server side of the connection went away.
    #[error("connection to {node} closed")]
    Disconnected {
        /// Node the client was connected to.
        node: String,
    },

    /// Server sent a frame the client could not decode or apply.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// No node with this index.
    #[error("no node {0}")]
    NoSuchNode(usize),
}

/// Result alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// How long clients wait for a condition before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cluster settings.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of gateways to start.
    pub instances: usize,
    /// Link gateways through the shared hub.
    pub sync: bool,
    /// Document lock lease ttl.
    pub lock_ttl: Duration,
    /// Document lock renew interval.
    pub lock_renew: Duration,
    /// Persistence debounce.
    pub debounce: Duration,
    /// Drain grace period.
    pub grace: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            instances: 2,
            sync: true,
            lock_ttl: Duration::from_secs(30),
            lock_renew: Duration::from_secs(10),
            debounce: Duration::from_millis(200),
            grace: Duration::from_secs(2),
        }
    }
}

impl ClusterConfig {
    /// Gateway configuration for every node.
    pub fn to_config(&self) -> Config {
        let mut config = Config::default();
        config.sync.enabled = self.sync;
        config.locks.ttl_ms = self.lock_ttl.as_millis() as u64;
        config.locks.renew_interval_ms = self.lock_renew.as_millis() as u64;
        config.persistence.debounce_ms = self.debounce.as_millis() as u64;
        config.persistence.max_debounce_ms = (self.debounce * 4).as_millis() as u64;
        config.persistence.retry_delay_ms = 50;
        config.backoff.base_ms = 10;
        config.backoff.max_ms = 100;
        config.backoff.jitter_ms = 0;
        config.shutdown.grace_secs = self.grace.as_secs().max(1);
        config
    }
}

/// One gateway in the cluster.
pub struct Node {
    /// Node name, also its instance id.
    pub name: String,
    /// The gateway.
    pub gateway: Arc<CollabGateway>,
    /// This node's handle on the shared hub.
    pub backend: MemoryBackend,
}

impl Node {
    /// Cut this node off from the shared hub.
    pub fn partition(&self) {
        tracing::info!(node = %self.name, "Partitioning node");
        self.backend.set_online(false);
    }

    /// Reconnect this node to the shared hub.
    pub fn heal(&self) {
        tracing::info!(node = %self.name, "Healing node");
        self.backend.set_online(true);
    }
}

/// A set of gateways sharing one hub and one document store.
pub struct Cluster {
    config: ClusterConfig,
    hub: MemoryHub,
    storage: MemoryStorage,
    nodes: Vec<Node>,
    next_client: usize,
}

impl Cluster {
    /// Start a cluster. Must be called inside a Tokio runtime.
    pub fn start(config: ClusterConfig) -> Self {
        let mut cluster = Self {
            hub: MemoryHub::new(),
            storage: MemoryStorage::new(),
            nodes: Vec::with_capacity(config.instances),
            next_client: 0,
            config,
        };
        for _ in 0..cluster.config.instances {
            cluster.add_node();
        }
        cluster
    }

    /// Start another gateway and return its index.
    pub fn add_node(&mut self) -> usize {
        let index = self.nodes.len();
        let name = format!("node-{index}");
        let backend = self.hub.client();
        let shared: Arc<dyn SyncBackend> = Arc::new(backend.clone());
        let gateway = Arc::new(CollabGateway::new(
            &self.config.to_config(),
            InstanceId::from_string(name.clone()),
            Arc::new(self.storage.clone()),
            Some(shared),
        ));
        self.nodes.push(Node {
            name,
            gateway,
            backend,
        });
        index
    }

    /// Node by index.
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The shared document store.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// The shared hub.
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    /// Connect a new client to `document` on node `index` and finish the
    /// initial sync.
    pub async fn connect(&mut self, index: usize, document: &DocumentName) -> HarnessResult<Client> {
        let node = self.nodes.get(index).ok_or(HarnessError::NoSuchNode(index))?;
        self.next_client += 1;
        let name = format!("client-{}", self.next_client);
        let mut client = Client::open(node, document, &name);
        client.sync().await?;
        Ok(client)
    }

    /// Drain every node.
    pub async fn drain_all(&self) {
        for node in &self.nodes {
            node.gateway.drain().await;
        }
    }
}

/// A fake Yjs client on one node.
///
/// Edits a text root named `t` and mirrors the default XML fragment.
pub struct Client {
    name: String,
    node: String,
    doc: Doc,
    events: mpsc::UnboundedSender<SocketEvent>,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    task: JoinHandle<()>,
    synced: bool,
    updates_received: usize,
    stateless: Vec<String>,
    closed: Option<CloseReason>,
}

impl Client {
    /// Open a connection without waiting for the initial sync.
    pub fn open(node: &Node, document: &DocumentName, name: &str) -> Self {
        let (raw, transport) = RawConnection::pair();
        let request = HandshakeRequest::get(format!("/collab/{document}"), name);
        let gateway = Arc::clone(&node.gateway);
        let task = tokio::spawn(async move { gateway.serve_connection(raw, request).await });
        let (events, frames) = transport.into_parts();

        let doc = Doc::new();
        doc.get_or_insert_text("t");
        doc.get_or_insert_xml_fragment(DEFAULT_FRAGMENT);

        Self {
            name: name.to_string(),
            node: node.name.clone(),
            doc,
            events,
            frames,
            task,
            synced: false,
            updates_received: 0,
            stateless: Vec::new(),
            closed: None,
        }
    }

    /// Client name, also its connection token.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send our state vector and wait for the server's answer.
    pub async fn sync(&mut self) -> HarnessResult<()> {
        let state_vector = self.doc.transact().state_vector();
        self.send(protocol::sync_step1(state_vector));
        self.wait_for("initial sync", |client| client.synced).await
    }

    /// Append `content` to the text and send the update.
    pub fn insert(&self, content: &str) {
        let text = self.doc.get_or_insert_text("t");
        let update = {
            let mut txn = self.doc.transact_mut();
            let len = text.len(&txn);
            text.insert(&mut txn, len, content);
            txn.encode_update_v1()
        };
        self.send(protocol::update(update));
    }

    /// Current text.
    pub fn text(&self) -> String {
        let text = self.doc.get_or_insert_text("t");
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Current XML of the default fragment.
    pub fn content_xml(&self) -> String {
        let fragment = self.doc.get_or_insert_xml_fragment(DEFAULT_FRAGMENT);
        let txn = self.doc.transact();
        fragment.get_string(&txn)
    }

    /// Incremental updates received since connecting.
    pub fn updates_received(&self) -> usize {
        self.updates_received
    }

    /// Stateless payloads received since connecting.
    pub fn stateless(&self) -> &[String] {
        &self.stateless
    }

    /// Close frame the server sent, if any.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.as_ref()
    }

    /// Process frames until `condition` holds.
    pub async fn wait_for(
        &mut self,
        what: &str,
        condition: impl Fn(&Client) -> bool,
    ) -> HarnessResult<()> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while !condition(self) {
            let frame = tokio::time::timeout_at(deadline, self.frames.recv())
                .await
                .map_err(|_| HarnessError::Timeout {
                    what: format!("{} on {}: {what}", self.name, self.node),
                })?;
            match frame {
                Some(frame) => self.handle(frame)?,
                None => {
                    return Err(HarnessError::Disconnected {
                        node: self.node.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Wait until the text equals `expected`.
    pub async fn wait_for_text(&mut self, expected: &str) -> HarnessResult<()> {
        let what = format!("text {expected:?}");
        self.wait_for(&what, |client| client.text() == expected).await
    }

    /// Wait for the server to close the connection.
    pub async fn wait_closed(&mut self) -> HarnessResult<CloseReason> {
        self.wait_for("close frame", |client| client.closed.is_some())
            .await?;
        Ok(self.closed.clone().unwrap_or_else(CloseReason::abnormal))
    }

    /// Handle every frame already queued, without waiting.
    pub fn poll(&mut self) -> HarnessResult<()> {
        while let Ok(frame) = self.frames.try_recv() {
            self.handle(frame)?;
        }
        Ok(())
    }

    /// Close the connection and wait for the server to finish with it.
    pub async fn close(self) {
        let _ = self.events.send(SocketEvent::Close(CloseReason::normal()));
        let _ = tokio::time::timeout(WAIT_TIMEOUT, self.task).await;
    }

    fn send(&self, frame: Vec<u8>) {
        let _ = self.events.send(SocketEvent::Message(frame));
    }

    fn handle(&mut self, frame: OutboundFrame) -> HarnessResult<()> {
        match frame {
            OutboundFrame::Binary(bytes) => self.handle_message(&bytes),
            OutboundFrame::Ping(payload) => {
                let _ = self.events.send(SocketEvent::Pong(payload));
                Ok(())
            }
            OutboundFrame::Close(reason) => {
                // Echo the close like a browser does.
                let _ = self.events.send(SocketEvent::Close(reason.clone()));
                self.closed = Some(reason);
                Ok(())
            }
        }
    }

    fn handle_message(&mut self, bytes: &[u8]) -> HarnessResult<()> {
        let message = Message::decode_v1(bytes).map_err(|e| HarnessError::BadFrame(e.to_string()))?;
        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = self.doc.transact().encode_diff_v1(&state_vector);
                self.send(protocol::sync_step2(diff));
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                self.apply(&update)?;
                self.synced = true;
            }
            Message::Sync(SyncMessage::Update(update)) => {
                self.apply(&update)?;
                self.updates_received += 1;
            }
            Message::Custom(tag, payload) if tag == protocol::MSG_STATELESS => {
                self.stateless
                    .push(String::from_utf8_lossy(&payload).into_owned());
            }
            _ => {}
        }
        Ok(())
    }

    fn apply(&mut self, update: &[u8]) -> HarnessResult<()> {
        let update = Update::decode_v1(update).map_err(|e| HarnessError::BadFrame(e.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| HarnessError::BadFrame(e.to_string()))
    }
}

/// Full state of a text-only document holding `content`.
pub fn text_state(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("t");
    text.insert(&mut doc.transact_mut(), 0, content);
    let state = doc.transact().encode_state_as_update_v1(&StateVector::default());
    state
}

/// Text and default fragment XML of a stored document state.
pub fn decode_state(state: &[u8]) -> HarnessResult<(String, String)> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("t");
    let fragment = doc.get_or_insert_xml_fragment(DEFAULT_FRAGMENT);
    let update = Update::decode_v1(state).map_err(|e| HarnessError::BadFrame(e.to_string()))?;
    doc.transact_mut()
        .apply_update(update)
        .map_err(|e| HarnessError::BadFrame(e.to_string()))?;
    let txn = doc.transact();
    Ok((text.get_string(&txn), fragment.get_string(&txn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_maps_cluster_settings() {
        let config = ClusterConfig {
            lock_ttl: Duration::from_millis(900),
            lock_renew: Duration::from_millis(300),
            ..ClusterConfig::default()
        }
        .to_config();
        assert!(config.sync.enabled);
        assert_eq!(config.locks.ttl_ms, 900);
        assert_eq!(config.locks.renew_interval_ms, 300);
        assert_eq!(config.backoff.jitter_ms, 0);
    }

    #[tokio::test]
    async fn cluster_starts_requested_nodes() {
        let cluster = Cluster::start(ClusterConfig {
            instances: 3,
            ..ClusterConfig::default()
        });
        assert_eq!(cluster.nodes().len(), 3);
        assert_eq!(cluster.node(2).gateway.instance().as_str(), "node-2");
    }

    #[tokio::test]
    async fn client_finishes_initial_sync() {
        let mut cluster = Cluster::start(ClusterConfig::default());
        let client = cluster.connect(0, &DocumentName::page(1)).await.unwrap();
        assert_eq!(client.text(), "");
        assert_eq!(cluster.node(0).gateway.connection_count(), 1);
        client.close().await;
    }

    #[test]
    fn stored_state_decodes() {
        let (text, content) = decode_state(&text_state("saved")).unwrap();
        assert_eq!(text, "saved");
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn connect_to_missing_node_fails() {
        let mut cluster = Cluster::start(ClusterConfig::default());
        assert!(matches!(
            cluster.connect(5, &DocumentName::page(1)).await,
            Err(HarnessError::NoSuchNode(5))
        ));
    }
}
