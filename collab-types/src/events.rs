//! Events carried inside a [`SyncMessage`](crate::SyncMessage).
//!
//! Every event kind has its own payload type so receivers never have to
//! guess what a payload contains.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An event published on a document's shared channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// CRDT delta (Yjs v1 update encoding).
    Update(Vec<u8>),
    /// Presence frame, relayed verbatim to local viewers.
    Awareness(Vec<u8>),
    /// Encoded state vector of the sender. Instances holding the document
    /// answer with the diff the sender is missing.
    SyncStep1(Vec<u8>),
    /// Control-plane event.
    Custom(CustomEvent),
}

impl SyncEvent {
    /// Discriminant used for logging and metrics.
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Update(_) => EventKind::Update,
            SyncEvent::Awareness(_) => EventKind::Awareness,
            SyncEvent::SyncStep1(_) => EventKind::SyncStep1,
            SyncEvent::Custom(CustomEvent::ForceReload { .. }) => EventKind::ForceReload,
            SyncEvent::Custom(CustomEvent::Stateless { .. }) => EventKind::Stateless,
        }
    }
}

/// Custom cross-instance events injected by the rest of the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomEvent {
    /// Disconnect every viewer of the document so clients reconnect and
    /// load fresh state.
    ForceReload {
        /// Human-readable reason, sent as the close reason.
        reason: Option<String>,
    },
    /// Deliver a stateless payload to every viewer of the document.
    Stateless {
        /// Opaque payload, usually JSON.
        payload: String,
    },
}

/// Flat discriminant of [`SyncEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`SyncEvent::Update`]
    Update,
    /// [`SyncEvent::Awareness`]
    Awareness,
    /// [`SyncEvent::SyncStep1`]
    SyncStep1,
    /// [`CustomEvent::ForceReload`]
    ForceReload,
    /// [`CustomEvent::Stateless`]
    Stateless,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Update => "update",
            EventKind::Awareness => "awareness",
            EventKind::SyncStep1 => "sync-step-1",
            EventKind::ForceReload => "force-reload",
            EventKind::Stateless => "stateless",
        };
        f.write_str(name)
    }
}
