//! Error types for collab-types.

use thiserror::Error;

/// Errors raised while building or decoding wire types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Envelope carries a protocol version this build does not speak
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Document names must be non-empty
    #[error("invalid document name: {0:?}")]
    InvalidDocumentName(String),
}
