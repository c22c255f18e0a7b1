//! # collab-types
//!
//! Wire format types shared by every Quire collaboration crate.
//!
//! - [`DocumentName`], [`InstanceId`], [`ConnectionId`] - Identity types
//! - [`SyncMessage`] - Envelope published on a document's shared channel
//! - [`SyncEvent`], [`CustomEvent`], [`EventKind`] - Tagged event model
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod events;
mod ids;

pub use envelope::{SyncMessage, PROTOCOL_VERSION};
pub use error::TypesError;
pub use events::{CustomEvent, EventKind, SyncEvent};
pub use ids::{ConnectionId, DocumentName, InstanceId};
