//! y-protocol framing.
//!
//! Client frames are lib0-encoded `yrs::sync::Message`s: sync (step 1,
//! step 2, update), awareness, and custom messages. Stateless payloads use
//! custom tag 5.

use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::error::EngineError;

/// Custom message tag carrying stateless payloads.
pub const MSG_STATELESS: u8 = 5;

/// An empty v1 update (no structs, empty delete set).
pub(crate) const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// What a client frame asks the engine to do.
#[derive(Debug)]
pub(crate) enum ClientFrame {
    /// Client sent its state vector and wants what it is missing.
    SyncStep1(StateVector),
    /// Client sent a CRDT update (step 2 or incremental).
    Update(Vec<u8>),
    /// Presence frame, relayed verbatim.
    Awareness,
    /// Understood but nothing to do (auth, awareness query, custom).
    Ignored(&'static str),
}

/// Classify a client frame.
pub(crate) fn decode(bytes: &[u8]) -> Result<ClientFrame, EngineError> {
    let message = Message::decode_v1(bytes).map_err(|e| EngineError::MalformedMessage {
        reason: e.to_string(),
    })?;
    Ok(match message {
        Message::Sync(SyncMessage::SyncStep1(sv)) => ClientFrame::SyncStep1(sv),
        Message::Sync(SyncMessage::SyncStep2(update)) | Message::Sync(SyncMessage::Update(update)) => {
            ClientFrame::Update(update)
        }
        Message::Awareness(_) => ClientFrame::Awareness,
        Message::AwarenessQuery => ClientFrame::Ignored("awareness-query"),
        Message::Auth(_) => ClientFrame::Ignored("auth"),
        Message::Custom(_, _) => ClientFrame::Ignored("custom"),
        #[allow(unreachable_patterns)]
        _ => ClientFrame::Ignored("unknown"),
    })
}

/// Frame asking the peer for what it has that we don't.
pub fn sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Frame answering a step 1 with the missing diff.
pub fn sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

/// Frame carrying an incremental update.
pub fn update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// Frame carrying a stateless payload.
pub fn stateless(payload: &str) -> Vec<u8> {
    Message::Custom(MSG_STATELESS, payload.as_bytes().to_vec()).encode_v1()
}

/// Decode a state vector sent over the shared backend.
pub(crate) fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, EngineError> {
    StateVector::decode_v1(bytes).map_err(|e| EngineError::MalformedMessage {
        reason: e.to_string(),
    })
}
