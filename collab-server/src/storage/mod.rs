//! Durable document storage.
//!
//! Documents are stored as full CRDT snapshots (v1 update encoding of the
//! whole document). A write either succeeds or fails; callers keep the
//! document dirty and retry on failure.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use collab_types::DocumentName;

/// Trait for document storage backends.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Read the latest snapshot of a document.
    ///
    /// Returns `None` if the document was never stored.
    async fn read(&self, document: &DocumentName) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the stored snapshot of a document.
    async fn write(&self, document: &DocumentName, state: &[u8]) -> Result<(), StorageError>;
}
