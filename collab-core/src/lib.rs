//! # collab-core
//!
//! Pure logic for Quire collaboration (no I/O, instant tests).
//!
//! This crate holds the state machines and bookkeeping that the server
//! drives, without touching sockets, storage, or timers:
//! - [`state`] - shared-backend link state and reconnect backoff
//! - [`debounce`] - when a dirty document is due to be persisted
//! - [`lease`] - lease table and lease timing for document locks
//!
//! Callers pass the current time in explicitly, so every transition is
//! deterministic under test. The server crate interprets the returned
//! actions and performs the actual I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod debounce;
pub mod lease;
pub mod state;

pub use debounce::{DebouncePolicy, DebounceState};
pub use lease::{Lease, LeaseError, LeaseTable, LeaseTiming};
pub use state::{LinkAction, LinkEvent, LinkNotice, LinkState, ReconnectPolicy};
