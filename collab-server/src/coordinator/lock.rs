//! Document locks on top of backend leases.
//!
//! Each held lock has one renewal task. The task renews every
//! `renew_interval`; if the backend reports the lease gone, or renewals keep
//! failing for a whole TTL, the lock's watch flips to [`LockState::Lost`] and
//! the task stops. Releasing (or dropping the manager) cancels renewal.

use collab_core::LeaseTiming;
use collab_types::DocumentName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{LeaseToken, SyncBackend};
use crate::error::{BackendError, LockError};
use crate::metrics::GatewayMetrics;

/// Whether a lock is still ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Lease held and being renewed.
    Held,
    /// Lease expired or was taken over; renewal stopped.
    Lost,
}

/// Observable state of one held lock.
#[derive(Debug, Clone)]
pub struct LockWatch {
    document: DocumentName,
    state: watch::Receiver<LockState>,
}

impl LockWatch {
    /// Locked document.
    pub fn document(&self) -> &DocumentName {
        &self.document
    }

    /// Current state.
    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// True while the lease is ours.
    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Wait until the lock is lost. Returns immediately if it already is,
    /// and also returns once the lock is released.
    pub async fn lost(&mut self) {
        let _ = self.state.wait_for(|state| *state == LockState::Lost).await;
    }
}

struct HeldLock {
    lease: LeaseToken,
    state: watch::Receiver<LockState>,
    renewal: JoinHandle<()>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}

/// Locks held by this instance.
pub struct LockManager {
    backend: Arc<dyn SyncBackend>,
    prefix: String,
    timing: LeaseTiming,
    metrics: Arc<GatewayMetrics>,
    held: Mutex<HashMap<DocumentName, HeldLock>>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("prefix", &self.prefix)
            .field("timing", &self.timing)
            .field("held", &self.held().len())
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Locks keyed `{prefix}:lock:{document}` on `backend`.
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        prefix: impl Into<String>,
        timing: LeaseTiming,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            timing,
            metrics,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Lease key of a document.
    pub fn key(&self, document: &DocumentName) -> String {
        format!("{}:lock:{}", self.prefix, document)
    }

    /// Acquire the lock and start renewing it.
    pub async fn lock(&self, document: &DocumentName) -> Result<LockWatch, LockError> {
        {
            let mut held = self.held();
            match held.get(document).map(|lock| *lock.state.borrow()) {
                Some(LockState::Held) => {
                    return Err(LockError::AlreadyHeld {
                        document: document.clone(),
                    })
                }
                Some(LockState::Lost) => {
                    held.remove(document);
                }
                None => {}
            }
        }

        let lease = self
            .backend
            .acquire_lease(&self.key(document), self.timing.ttl)
            .await
            .map_err(|e| match e {
                BackendError::LeaseBusy { .. } => LockError::Busy {
                    document: document.clone(),
                },
                other => LockError::Backend(other),
            })?;

        let (tx, rx) = watch::channel(LockState::Held);
        let renewal = tokio::spawn(renew(
            Arc::clone(&self.backend),
            lease.clone(),
            self.timing,
            tx,
            document.clone(),
            Arc::clone(&self.metrics),
        ));

        let previous = self.held().insert(
            document.clone(),
            HeldLock {
                lease,
                state: rx.clone(),
                renewal,
            },
        );
        if let Some(previous) = previous {
            // Lost a race with a concurrent lock() on the same document.
            let _ = self.backend.release_lease(&previous.lease).await;
        }

        info!(document = %document, "Document locked");
        Ok(LockWatch {
            document: document.clone(),
            state: rx,
        })
    }

    /// Stop renewing and give the lease back.
    ///
    /// Returns [`LockError::Expired`] if the lock had already been lost.
    pub async fn release(&self, document: &DocumentName) -> Result<(), LockError> {
        let lock = self
            .held()
            .remove(document)
            .ok_or_else(|| LockError::NotHeld {
                document: document.clone(),
            })?;
        lock.renewal.abort();
        let state = *lock.state.borrow();

        self.backend
            .release_lease(&lock.lease)
            .await
            .map_err(LockError::Backend)?;
        debug!(document = %document, "Document lock released");

        match state {
            LockState::Held => Ok(()),
            LockState::Lost => Err(LockError::Expired {
                document: document.clone(),
            }),
        }
    }

    /// State of a lock this instance holds or held.
    pub fn state(&self, document: &DocumentName) -> Option<LockState> {
        self.held().get(document).map(|lock| *lock.state.borrow())
    }

    /// Release every lock. Errors are logged.
    pub async fn release_all(&self) {
        let documents: Vec<_> = self.held().keys().cloned().collect();
        for document in documents {
            if let Err(e) = self.release(&document).await {
                debug!(document = %document, error = %e, "Lock release failed");
            }
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<DocumentName, HeldLock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn renew(
    backend: Arc<dyn SyncBackend>,
    lease: LeaseToken,
    timing: LeaseTiming,
    state: watch::Sender<LockState>,
    document: DocumentName,
    metrics: Arc<GatewayMetrics>,
) {
    let mut last_renewed = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(timing.renew_interval).await;
        match backend.renew_lease(&lease, timing.ttl).await {
            Ok(()) => last_renewed = tokio::time::Instant::now(),
            Err(BackendError::LeaseExpired { .. }) => {
                warn!(document = %document, "Document lock lost");
                break;
            }
            Err(e) if last_renewed.elapsed() >= timing.ttl => {
                warn!(document = %document, error = %e, "Document lock lapsed while backend was unreachable");
                break;
            }
            Err(e) => {
                warn!(document = %document, error = %e, "Lock renewal failed, retrying");
            }
        }
    }
    GatewayMetrics::incr(&metrics.lock_losses);
    state.send_replace(LockState::Lost);
}
