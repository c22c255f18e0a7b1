//! SyncMessage - the envelope published on a document's shared channel.

use serde::{Deserialize, Serialize};

use crate::{DocumentName, InstanceId, SyncEvent, TypesError};

/// Envelope format version understood by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope for one cross-instance event.
///
/// Receivers drop envelopes whose `origin` is their own instance, and must
/// tolerate seeing the same CRDT update more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Envelope version (currently 1)
    pub version: u8,
    /// Document the event belongs to
    pub document: DocumentName,
    /// Event and its payload
    pub event: SyncEvent,
    /// Instance that published the envelope
    pub origin: InstanceId,
    /// Unix timestamp (milliseconds) - informational only
    pub sent_at: u64,
}

impl SyncMessage {
    /// Create a new envelope stamped with the current time.
    pub fn new(document: DocumentName, event: SyncEvent, origin: InstanceId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            document,
            event,
            origin,
            sent_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// True if `instance` published this envelope.
    pub fn is_from(&self, instance: &InstanceId) -> bool {
        &self.origin == instance
    }

    /// Serialize to MessagePack bytes (named fields).
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        rmp_serde::to_vec_named(self).map_err(TypesError::Serialization)
    }

    /// Deserialize from MessagePack bytes, rejecting unknown versions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        let message: Self = rmp_serde::from_slice(bytes).map_err(TypesError::Deserialization)?;
        if message.version != PROTOCOL_VERSION {
            return Err(TypesError::UnsupportedVersion(message.version));
        }
        Ok(message)
    }
}
