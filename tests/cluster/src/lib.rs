//! # cluster-tests
//!
//! Multi-instance test harness for Quire collaboration.
//!
//! Starts several collaboration gateways in one process, linked through a
//! shared in-memory pub/sub + lease hub and a shared document store, and
//! drives them with fake Yjs clients. Scenarios cover:
//! - Convergence of concurrent edits across instances
//! - Server-side content replacement reaching every viewer
//! - Distributed document locks under renewal and partition
//! - Shared backend partitions and recovery
//! - Graceful drain

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assertions;
pub mod harness;

#[cfg(test)]
mod scenarios;
