//! Identity types for Quire collaboration.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TypesError;

/// Name of one collaborative document, e.g. `page.42`.
///
/// The same name on two instances refers to the same logical document.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentName(String);

impl DocumentName {
    /// Create a document name, rejecting empty or blank input.
    pub fn new(name: impl Into<String>) -> Result<Self, TypesError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TypesError::InvalidDocumentName(name));
        }
        Ok(Self(name))
    }

    /// Name of the page document with the given id (`page.<id>`).
    pub fn page(id: impl fmt::Display) -> Self {
        Self(format!("page.{id}"))
    }

    /// Borrow the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentName({})", self.0)
    }
}

/// Identity of one server instance.
///
/// Generated once at process start and handed to every component that
/// publishes or filters cross-instance traffic.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate `collab-<hostname>-<10 random chars>`.
    pub fn generate() -> Self {
        Self(format!("collab-{}-{}", hostname(), random_suffix(10)))
    }

    /// Use an explicit identity (tests, fixed deployments).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

/// Identifies one client connection.
///
/// On the coordinated path this is the `sec-websocket-key` sent during the
/// handshake, which is what close events are correlated by.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap a handshake token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Fresh random id for connections that carry no token of their own
    /// (direct sessions, tests).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "ConnectionId({short})")
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn random_suffix(len: usize) -> String {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    URL_SAFE_NO_PAD.encode(bytes).chars().take(len).collect()
}
