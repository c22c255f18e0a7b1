//! In-process shared backend.

use super::{LeaseToken, SyncBackend};
use crate::engine::now;
use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use collab_core::{LeaseError, LeaseTable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// The shared "server" every [`MemoryBackend`] client talks to.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    /// channel -> client id -> subscriber
    channels: Mutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>>,
    leases: Mutex<LeaseTable>,
    next_client: AtomicU64,
    published: AtomicU64,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client.
    pub fn client(&self) -> MemoryBackend {
        MemoryBackend {
            hub: self.clone(),
            id: self.inner.next_client.fetch_add(1, Ordering::SeqCst),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Messages published so far.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Live subscribers of a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn leases(&self) -> MutexGuard<'_, LeaseTable> {
        self.inner
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One instance's connection to a [`MemoryHub`].
///
/// Clones share the connection, so a test can keep a handle to flip
/// [`MemoryBackend::set_online`] while the coordinator owns another.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    hub: MemoryHub,
    id: u64,
    online: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Simulate a partition. Going offline drops every subscription of this
    /// client and fails all calls until it comes back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            let mut channels = self.hub.channels();
            for subscribers in channels.values_mut() {
                subscribers.remove(&self.id);
            }
            channels.retain(|_, subscribers| !subscribers.is_empty());
        }
    }

    /// True unless partitioned.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> BackendResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BackendError::Unavailable {
                reason: "backend unreachable".into(),
            })
        }
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BackendResult<()> {
        self.check_online()?;
        let mut channels = self.hub.channels();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|_, tx| tx.send(payload.clone()).is_ok());
        }
        self.hub.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .channels()
            .entry(channel.to_string())
            .or_default()
            .insert(self.id, tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> BackendResult<()> {
        self.check_online()?;
        let mut channels = self.hub.channels();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn acquire_lease(&self, key: &str, ttl: Duration) -> BackendResult<LeaseToken> {
        self.check_online()?;
        let lease = LeaseToken::generate(key);
        self.hub
            .leases()
            .acquire(key, &lease.value, ttl, now())
            .map_err(|_| BackendError::LeaseBusy {
                key: key.to_string(),
            })?;
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &LeaseToken, ttl: Duration) -> BackendResult<()> {
        self.check_online()?;
        self.hub
            .leases()
            .renew(&lease.key, &lease.value, ttl, now())
            .map(|_| ())
            .map_err(|e| match e {
                LeaseError::Busy | LeaseError::Expired => BackendError::LeaseExpired {
                    key: lease.key.clone(),
                },
            })
    }

    async fn release_lease(&self, lease: &LeaseToken) -> BackendResult<()> {
        self.check_online()?;
        self.hub.leases().release(&lease.key, &lease.value);
        Ok(())
    }

    async fn ping(&self) -> BackendResult<()> {
        self.check_online()
    }
}
