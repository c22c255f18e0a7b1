//! Cluster scenarios.
//!
//! - `convergence` - concurrent edits across instances, late joiners,
//!   exactly-once delivery
//! - `content` - server-side content replacement and custom events
//! - `locks` - distributed document locks (paused clock)
//! - `partition` - shared backend loss and recovery
//! - `lifecycle` - graceful drain

mod content;
mod convergence;
mod lifecycle;
mod locks;
mod partition;
