//! Inbound handshake validation.

use collab_types::{ConnectionId, DocumentName};
use std::net::SocketAddr;

use crate::error::ConnectionError;

/// What the transport saw when the client connected.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    /// HTTP method of the upgrade request.
    pub method: String,
    /// Request URL (path and query).
    pub url: String,
    /// `sec-websocket-key` header.
    pub websocket_key: Option<String>,
    /// `sec-websocket-protocol` header.
    pub websocket_protocol: Option<String>,
    /// Peer address, when known.
    pub remote_address: Option<SocketAddr>,
}

/// A handshake that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Connection identity (the `sec-websocket-key` token).
    pub connection_id: ConnectionId,
    /// Document the client asked for.
    pub document: DocumentName,
    /// Peer address, when known.
    pub remote_address: Option<SocketAddr>,
}

impl HandshakeRequest {
    /// Build a request for `GET url` with a connection token.
    pub fn get(url: impl Into<String>, websocket_key: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            websocket_key: Some(websocket_key.into()),
            ..Self::default()
        }
    }

    /// Check that the connection token and document name are present.
    pub fn validate(&self) -> Result<Handshake, ConnectionError> {
        let token = self
            .websocket_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConnectionError::MissingConnectionToken)?;

        let document = document_from_url(&self.url)
            .and_then(|name| DocumentName::new(name).ok())
            .ok_or(ConnectionError::MissingDocumentName)?;

        Ok(Handshake {
            connection_id: ConnectionId::from_token(token),
            document,
            remote_address: self.remote_address,
        })
    }
}

/// Last non-empty path segment, query and fragment stripped.
fn document_from_url(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/').find(|segment| !segment.is_empty())
}
