//! Time-limited exclusive leases.
//!
//! A lease is held by whoever presents its token. It lapses on its own once
//! `expires_at` passes, so a holder that dies never blocks a document
//! forever; a live holder keeps the lease by renewing well before expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lease table errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// Another token holds an unexpired lease on the key.
    #[error("lease is held by another owner")]
    Busy,
    /// The caller's lease lapsed or was taken over.
    #[error("lease expired or is held by another owner")]
    Expired,
}

/// Lease and renewal timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long one acquisition or renewal is valid.
    pub ttl: Duration,
    /// How often the holder renews.
    pub renew_interval: Duration,
}

impl LeaseTiming {
    /// Renewal must be strictly shorter than the lease and non-zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.ttl.is_zero() {
            return Err("lease ttl must be greater than zero".into());
        }
        if self.renew_interval.is_zero() {
            return Err("lease renew interval must be greater than zero".into());
        }
        if self.renew_interval >= self.ttl {
            return Err(format!(
                "lease renew interval ({:?}) must be shorter than ttl ({:?})",
                self.renew_interval, self.ttl
            ));
        }
        Ok(())
    }
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        }
    }
}

/// One lease entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Opaque owner token.
    pub token: String,
    /// Instant after which the lease is free.
    pub expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Leases by key.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<String, Lease>,
}

impl LeaseTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease on `key` for `ttl`, unless another token holds it.
    ///
    /// Re-acquiring with the token that already holds the key extends it.
    pub fn acquire(
        &mut self,
        key: &str,
        token: &str,
        ttl: Duration,
        now: Instant,
    ) -> Result<Instant, LeaseError> {
        if let Some(existing) = self.leases.get(key) {
            if existing.is_live(now) && existing.token != token {
                return Err(LeaseError::Busy);
            }
        }
        let expires_at = now + ttl;
        self.leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at,
            },
        );
        Ok(expires_at)
    }

    /// Extend a lease the caller still holds.
    pub fn renew(
        &mut self,
        key: &str,
        token: &str,
        ttl: Duration,
        now: Instant,
    ) -> Result<Instant, LeaseError> {
        match self.leases.get_mut(key) {
            Some(lease) if lease.token == token && lease.is_live(now) => {
                lease.expires_at = now + ttl;
                Ok(lease.expires_at)
            }
            _ => Err(LeaseError::Expired),
        }
    }

    /// Drop the lease if `token` holds it. Returns whether anything was released.
    pub fn release(&mut self, key: &str, token: &str) -> bool {
        match self.leases.get(key) {
            Some(lease) if lease.token == token => {
                self.leases.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Current live holder of `key`.
    pub fn holder(&self, key: &str, now: Instant) -> Option<&Lease> {
        self.leases.get(key).filter(|lease| lease.is_live(now))
    }

    /// Forget expired entries.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.is_live(now));
        before - self.leases.len()
    }
}
