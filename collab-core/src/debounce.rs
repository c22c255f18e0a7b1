//! Persistence debounce bookkeeping.
//!
//! A document becomes due for persistence once it has been quiet for
//! `debounce`, or once it has been dirty for `max_debounce`, whichever comes
//! first. A failed write leaves the document dirty and makes it due again
//! after a retry delay; it never marks the document clean.

use std::time::{Duration, Instant};

/// Debounce timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebouncePolicy {
    /// Quiet period after the last change.
    pub debounce: Duration,
    /// Upper bound on how long a change may stay unpersisted.
    pub max_debounce: Duration,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(10),
            max_debounce: Duration::from_secs(45),
        }
    }
}

/// Dirty-tracking for one document.
#[derive(Debug, Clone, Default)]
pub struct DebounceState {
    /// First unpersisted change.
    dirty_since: Option<Instant>,
    /// Most recent change.
    last_change: Option<Instant>,
    /// Bumped on every change; a flush only cleans the generation it captured.
    generation: u64,
    /// Set after a failed write.
    retry_at: Option<Instant>,
}

impl DebounceState {
    /// Create a clean state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change at `now`.
    pub fn record_change(&mut self, now: Instant) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
        self.last_change = Some(now);
        self.generation = self.generation.wrapping_add(1);
    }

    /// True if there are unpersisted changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// When the document should next be persisted, `None` if clean.
    pub fn due_at(&self, policy: &DebouncePolicy) -> Option<Instant> {
        let dirty_since = self.dirty_since?;
        let last_change = self.last_change.unwrap_or(dirty_since);
        let due = (last_change + policy.debounce).min(dirty_since + policy.max_debounce);
        Some(match self.retry_at {
            Some(retry_at) => due.max(retry_at),
            None => due,
        })
    }

    /// True if the document is dirty and its due time has passed.
    pub fn is_due(&self, policy: &DebouncePolicy, now: Instant) -> bool {
        self.due_at(policy).is_some_and(|due| due <= now)
    }

    /// Capture the generation a snapshot is being taken at.
    pub fn begin_flush(&self) -> u64 {
        self.generation
    }

    /// A snapshot taken at `generation` was written successfully.
    ///
    /// Changes recorded after the snapshot keep the document dirty.
    pub fn complete_flush(&mut self, generation: u64) {
        self.retry_at = None;
        if generation == self.generation {
            self.dirty_since = None;
            self.last_change = None;
        } else {
            self.dirty_since = self.last_change;
        }
    }

    /// A write failed at `now`; try again no earlier than `now + retry_delay`.
    pub fn fail_flush(&mut self, now: Instant, retry_delay: Duration) {
        self.retry_at = Some(now + retry_delay);
    }
}
