//! Shared-backend link state machine.
//!
//! Tracks whether this instance can currently talk to the shared pub/sub +
//! lease backend. The state machine takes events as input and produces a new
//! state plus a list of actions to execute; the coordinator performs the
//! actual probing, resubscribing and republishing.
//!
//! While the link is degraded, local viewers keep being served from local
//! state. Once a probe succeeds, every loaded document is resubscribed and
//! its full state republished so instances that diverged during the outage
//! converge again.

use std::time::Duration;

/// Link state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Backend reachable; cross-instance sync active.
    Connected,
    /// Backend unreachable; serving local viewers only.
    Degraded {
        /// Number of reconnect attempts scheduled so far.
        attempt: u32,
    },
}

impl LinkState {
    /// Create a new state machine in the Connected state.
    pub fn new() -> Self {
        Self::Connected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects.
    pub fn on_event(self, event: LinkEvent) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            (Self::Connected, LinkEvent::OperationFailed { error }) => (
                Self::Degraded { attempt: 1 },
                vec![
                    LinkAction::Emit(LinkNotice::Degraded { error }),
                    LinkAction::StartReconnectTimer { attempt: 1 },
                ],
            ),

            // A reconnect timer is already pending; further failures add nothing.
            (state @ Self::Degraded { .. }, LinkEvent::OperationFailed { .. }) => (state, vec![]),

            (Self::Degraded { attempt }, LinkEvent::ProbeFailed { error }) => {
                let next_attempt = attempt.saturating_add(1);
                (
                    Self::Degraded {
                        attempt: next_attempt,
                    },
                    vec![
                        LinkAction::Emit(LinkNotice::ProbeFailed { attempt, error }),
                        LinkAction::StartReconnectTimer {
                            attempt: next_attempt,
                        },
                    ],
                )
            }

            (Self::Degraded { attempt }, LinkEvent::ProbeSucceeded) => (
                Self::Connected,
                vec![
                    LinkAction::Resubscribe,
                    LinkAction::Republish,
                    LinkAction::Emit(LinkNotice::Restored { attempts: attempt }),
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if cross-instance sync is currently possible.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur on the backend link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A publish, subscribe or lease call failed.
    OperationFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// A reconnect probe failed.
    ProbeFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// A reconnect probe succeeded.
    ProbeSucceeded,
}

/// Actions for the coordinator to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Sleep for the backoff of `attempt`, then probe the backend.
    StartReconnectTimer {
        /// Attempt number the delay is computed for.
        attempt: u32,
    },
    /// Re-establish channel subscriptions of every loaded document.
    Resubscribe,
    /// Publish the full state of every loaded document.
    Republish,
    /// Report a link change.
    Emit(LinkNotice),
}

/// Link changes worth logging or counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// Link went down.
    Degraded {
        /// Error that took it down.
        error: String,
    },
    /// A reconnect probe failed.
    ProbeFailed {
        /// Attempt that failed.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// Link is back.
    Restored {
        /// Attempts it took.
        attempts: u32,
    },
}

/// Exponential reconnect backoff with jitter.
///
/// Delay for attempt `n` (1-based) is `min(max, base * 2^(n-1))` plus a random
/// jitter in `0..=jitter`, so instances restarting together do not probe in
/// lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay of the first attempt.
    pub base: Duration,
    /// Upper bound of the exponential part.
    pub max: Duration,
    /// Upper bound of the random jitter.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Deterministic part of the delay for `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Full delay for `attempt`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + random_jitter(self.jitter)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

fn random_jitter(upper: Duration) -> Duration {
    let upper_ms = upper.as_millis() as u64;
    if upper_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    Duration::from_millis(u64::from_le_bytes(bytes) % (upper_ms + 1))
}
