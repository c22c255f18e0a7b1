//! Error types for collab-server.

use collab_types::{DocumentName, TypesError};
use std::path::PathBuf;

/// Main error type for collab-server operations.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Document engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Connection rejected or failed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Shared backend error.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Document lock error.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Content conversion error.
    #[error("conversion error: {0}")]
    Convert(#[from] ConvertError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Storage temporarily unreachable.
    #[error("storage unavailable: {reason}")]
    Unavailable {
        /// Why the write or read failed.
        reason: String,
    },

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Document engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Frame is not a valid sync-protocol message.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// Decoder error.
        reason: String,
    },

    /// CRDT update could not be decoded or applied.
    #[error("invalid update for {document}: {reason}")]
    InvalidUpdate {
        /// Target document.
        document: DocumentName,
        /// Decoder error.
        reason: String,
    },

    /// No attached connection with this id.
    #[error("unknown connection: {connection}")]
    UnknownConnection {
        /// Connection id.
        connection: String,
    },

    /// A connection with this id is already attached.
    #[error("connection already attached: {connection}")]
    DuplicateConnection {
        /// Connection id.
        connection: String,
    },

    /// Loading the document from storage failed.
    #[error("failed to load {document}: {source}")]
    Load {
        /// Document being loaded.
        document: DocumentName,
        /// Underlying storage error.
        source: StorageError,
    },
}

/// Per-connection errors. Never fatal to the instance.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Handshake carried no `sec-websocket-key`.
    #[error("missing connection token")]
    MissingConnectionToken,

    /// Handshake URL names no document.
    #[error("missing document name")]
    MissingDocumentName,

    /// Instance is draining.
    #[error("server shutting down")]
    ShuttingDown,

    /// Socket already closed.
    #[error("connection closed")]
    Closed,

    /// Attaching to the document failed.
    #[error("attach failed: {0}")]
    Attach(#[from] EngineError),
}

impl ConnectionError {
    /// WebSocket close code sent when rejecting with this error.
    pub fn close_code(&self) -> u16 {
        match self {
            ConnectionError::MissingConnectionToken | ConnectionError::MissingDocumentName => 4400,
            ConnectionError::ShuttingDown => 1001,
            ConnectionError::Closed => 1000,
            ConnectionError::Attach(_) => 1011,
        }
    }
}

/// Shared pub/sub + lease backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Backend unreachable.
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// Connection failure description.
        reason: String,
    },

    /// Lease held by someone else.
    #[error("lease busy: {key}")]
    LeaseBusy {
        /// Lease key.
        key: String,
    },

    /// Lease lapsed or was taken over.
    #[error("lease expired: {key}")]
    LeaseExpired {
        /// Lease key.
        key: String,
    },

    /// Envelope encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] TypesError),
}

/// Document lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another holder has the lock.
    #[error("document {document} is locked by another holder")]
    Busy {
        /// Locked document.
        document: DocumentName,
    },

    /// Release of a lock this instance does not hold.
    #[error("lock on {document} is not held")]
    NotHeld {
        /// Document.
        document: DocumentName,
    },

    /// This instance already holds the lock.
    #[error("lock on {document} is already held")]
    AlreadyHeld {
        /// Document.
        document: DocumentName,
    },

    /// Lease expired while held.
    #[error("lock on {document} expired")]
    Expired {
        /// Document.
        document: DocumentName,
    },

    /// Backend failure while acquiring or releasing.
    #[error("lock backend error: {0}")]
    Backend(BackendError),
}

impl LockError {
    /// True if trying again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::Busy { .. } | LockError::Backend(BackendError::Unavailable { .. })
        )
    }
}

/// Content conversion errors.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// Content is not a valid node tree.
    #[error("invalid content: {reason}")]
    InvalidContent {
        /// What is wrong with it.
        reason: String,
    },

    /// Applying the converted update failed.
    #[error("failed to apply converted content: {reason}")]
    Apply {
        /// Decoder or integration error.
        reason: String,
    },
}

/// Result type alias for collab-server operations.
pub type Result<T> = std::result::Result<T, CollabError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
