//! Socket adapter.
//!
//! A raw connection is a pair of channels: inbound [`SocketEvent`]s produced
//! by the transport and outbound [`OutboundFrame`]s consumed by it. The
//! WebSocket glue in [`crate::http`] and the test harness both speak this
//! shape, so nothing above this module knows which transport it is talking to.
//!
//! [`SocketAdapter`] wraps only the outbound half. It never reads inbound
//! events itself; whoever owns the [`RawConnection`] feeds them in through
//! [`SocketAdapter::emit`], which fans each one out to every listener.

use collab_types::ConnectionId;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};

use crate::error::ConnectionError;

/// Listener capacity per socket. Pongs and closes are the only events that
/// go through it, so this is generous.
const LISTENER_CAPACITY: usize = 64;

/// Close code and reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseReason {
    /// Build a close reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// 1000, normal closure.
    pub fn normal() -> Self {
        Self::new(1000, "")
    }

    /// 1001, server going away.
    pub fn going_away() -> Self {
        Self::new(1001, "server shutting down")
    }

    /// 1006, transport ended without a close frame.
    pub fn abnormal() -> Self {
        Self::new(1006, "connection lost")
    }
}

/// Event produced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Binary frame from the client.
    Message(Vec<u8>),
    /// Keepalive answer.
    Pong(Vec<u8>),
    /// Client closed (or the transport died).
    Close(CloseReason),
}

/// Frame for the transport to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Binary frame to the client.
    Binary(Vec<u8>),
    /// Keepalive ping.
    Ping(Vec<u8>),
    /// Close the connection.
    Close(CloseReason),
}

/// Server side of a raw connection.
#[derive(Debug)]
pub struct RawConnection {
    /// Events from the client.
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
    /// Frames to the client.
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl RawConnection {
    /// Create a connected pair: the server side and the transport side.
    pub fn pair() -> (RawConnection, TransportEnd) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        (
            RawConnection {
                events: event_rx,
                outbound: frame_tx,
            },
            TransportEnd {
                events: event_tx,
                frames: frame_rx,
            },
        )
    }
}

/// Transport side of a raw connection.
#[derive(Debug)]
pub struct TransportEnd {
    events: mpsc::UnboundedSender<SocketEvent>,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl TransportEnd {
    /// Deliver a client frame. Returns false once the server side is gone.
    pub fn message(&self, bytes: Vec<u8>) -> bool {
        self.events.send(SocketEvent::Message(bytes)).is_ok()
    }

    /// Deliver a pong.
    pub fn pong(&self, payload: Vec<u8>) -> bool {
        self.events.send(SocketEvent::Pong(payload)).is_ok()
    }

    /// Deliver a client close.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.events.send(SocketEvent::Close(reason)).is_ok()
    }

    /// Next frame the server sent, `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.frames.try_recv().ok()
    }

    /// Split into the event sender and frame receiver.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<SocketEvent>,
        mpsc::UnboundedReceiver<OutboundFrame>,
    ) {
        (self.events, self.frames)
    }
}

/// Uniform event interface over one raw connection.
#[derive(Debug)]
pub struct SocketAdapter {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    listeners: broadcast::Sender<SocketEvent>,
    closed: AtomicBool,
}

impl SocketAdapter {
    /// Wrap the outbound half of a raw connection.
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        Self {
            id,
            outbound,
            listeners,
            closed: AtomicBool::new(false),
        }
    }

    /// Connection this adapter belongs to.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Re-emit an event to every listener. Returns how many received it.
    pub fn emit(&self, event: SocketEvent) -> usize {
        if matches!(event, SocketEvent::Close(_)) {
            self.closed.store(true, Ordering::SeqCst);
        }
        self.listeners.send(event).unwrap_or(0)
    }

    /// Listen for emitted events.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.listeners.subscribe()
    }

    /// Send a binary frame.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(OutboundFrame::Binary(bytes))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Send a keepalive ping.
    pub fn ping(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(OutboundFrame::Ping(Vec::new()))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Close the connection. Only the first call sends a close frame.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(OutboundFrame::Close(reason));
    }

    /// True once closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }
}
