//! In-memory storage with failure injection.

use super::DocumentStorage;
use crate::error::StorageError;
use async_trait::async_trait;
use collab_types::DocumentName;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// In-memory document storage.
///
/// Clones share the same contents, so several simulated instances can be
/// pointed at one "database".
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    documents: Mutex<HashMap<DocumentName, Vec<u8>>>,
    writes: AtomicU64,
    fail_writes: AtomicU32,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Fail every read and write until set back to `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every read and write by `latency` on the runtime clock.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Stored snapshot, bypassing failure injection.
    pub fn snapshot(&self, document: &DocumentName) -> Option<Vec<u8>> {
        self.documents().get(document).cloned()
    }

    /// Seed a snapshot, bypassing failure injection.
    pub fn insert(&self, document: DocumentName, state: Vec<u8>) {
        self.documents().insert(document, state);
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentName, Vec<u8>>> {
        self.inner
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let ms = self.inner.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "storage offline".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStorage for MemoryStorage {
    async fn read(&self, document: &DocumentName) -> Result<Option<Vec<u8>>, StorageError> {
        self.delay().await;
        self.check_available()?;
        Ok(self.snapshot(document))
    }

    async fn write(&self, document: &DocumentName, state: &[u8]) -> Result<(), StorageError> {
        self.delay().await;
        self.check_available()?;
        let injected = self
            .inner
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable {
                reason: "injected write failure".into(),
            });
        }
        self.insert(document.clone(), state.to_vec());
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
