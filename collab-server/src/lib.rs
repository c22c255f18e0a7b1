//! # collab-server
//!
//! Real-time collaborative document sync server.
//!
//! Clients edit shared rich-text documents over WebSockets using the Yjs
//! sync protocol. Each instance keeps the documents its clients view in
//! memory, persists them with a debounce, and (in distributed mode) exchanges
//! deltas with sibling instances over a shared pub/sub + lease backend.
//!
//! ## Architecture
//!
//! ```text
//!  client ──► router ──┬─► engine                  (local mode)
//!                      └─► coordinator ─► engine   (distributed mode)
//!                              │
//!                              ▼
//!                    shared backend channel ◄──► sibling instances
//!
//!  engine ──► debounced persistence ──► storage
//! ```
//!
//! [`gateway::CollabGateway`] wires everything together; [`http`] serves the
//! WebSocket route and the operational endpoints.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod backend;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod handshake;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod router;
pub mod storage;
