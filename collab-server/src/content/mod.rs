//! Server-side content replacement.
//!
//! Replaces the rich-text content of a live document so that every viewer,
//! local or on a sibling instance, sees the new content arrive as an
//! ordinary CRDT delta.

mod prosemirror;

pub use prosemirror::ProseMirrorConverter;

use collab_types::DocumentName;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::{TransactionMut, Update, WriteTxn, XmlFragment};

use crate::coordinator::LockWatch;
use crate::engine::{DocumentEngine, DEFAULT_FRAGMENT};
use crate::error::{ConvertError, LockError, Result};

/// Turns editor content into a CRDT update of the `default` fragment.
pub trait ContentConverter: Send + Sync {
    /// Build a full-state update holding `content` and nothing else.
    fn to_crdt_update(&self, content: &Value) -> std::result::Result<Vec<u8>, ConvertError>;
}

/// Replaces document content through direct sessions.
pub struct ContentReplacer {
    engine: Arc<DocumentEngine>,
    converter: Arc<dyn ContentConverter>,
}

impl std::fmt::Debug for ContentReplacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentReplacer").finish_non_exhaustive()
    }
}

impl ContentReplacer {
    /// Create a replacer for `engine`.
    pub fn new(engine: Arc<DocumentEngine>, converter: Arc<dyn ContentConverter>) -> Self {
        Self { engine, converter }
    }

    /// Replace the content of a document that is loaded on this instance.
    ///
    /// Returns `Ok(false)` without touching anything when the document is not
    /// loaded (nobody is viewing it here); the caller then only needs to
    /// update its own records. Otherwise the old fragment is cleared and the
    /// new content applied in one transaction, and the delta is broadcast.
    pub async fn replace(&self, document: &DocumentName, content: &Value) -> Result<bool> {
        let Some(session) = self.engine.open_direct_if_loaded(document) else {
            debug!(document = %document, "Not loaded here, skipping live replace");
            return Ok(false);
        };

        let update = match self.converter.to_crdt_update(content) {
            Ok(update) => update,
            Err(e) => {
                session.disconnect().await;
                return Err(e.into());
            }
        };
        let applied = session.transact(|txn| replace_fragment(txn, &update));
        session.disconnect().await;
        applied?;

        debug!(document = %document, "Content replaced for active viewers");
        Ok(true)
    }

    /// Replace the content of a document whether or not it is loaded.
    ///
    /// Loads the document if needed so the new state is merged with the
    /// stored one and persisted when the temporary session ends.
    pub async fn replace_stored(&self, document: &DocumentName, content: &Value) -> Result<()> {
        let update = self.converter.to_crdt_update(content)?;
        let session = self.engine.open_direct(document).await?;
        let applied = session.transact(|txn| replace_fragment(txn, &update));
        session.disconnect().await;
        applied?;
        debug!(document = %document, "Content replaced in storage");
        Ok(())
    }

    /// Replace the content of a document while `lock` is held, loading the
    /// document if nobody views it here.
    ///
    /// The lock is checked after loading and right before the write. If it
    /// was lost the document is left untouched and [`LockError::Expired`]
    /// is returned. Returns whether the document had live viewers.
    pub async fn replace_locked(
        &self,
        document: &DocumentName,
        content: &Value,
        lock: &LockWatch,
    ) -> Result<bool> {
        let update = self.converter.to_crdt_update(content)?;
        let (session, live) = match self.engine.open_direct_if_loaded(document) {
            Some(session) => (session, true),
            None => (self.engine.open_direct(document).await?, false),
        };
        if !lock.is_held() {
            session.disconnect().await;
            return Err(LockError::Expired {
                document: document.clone(),
            }
            .into());
        }
        let applied = session.transact(|txn| replace_fragment(txn, &update));
        session.disconnect().await;
        applied?;
        debug!(document = %document, live, "Content replaced under lock");
        Ok(live)
    }
}

/// Clear the default fragment and apply `update`, inside `txn`.
pub(crate) fn replace_fragment(
    txn: &mut TransactionMut<'_>,
    update: &[u8],
) -> std::result::Result<(), ConvertError> {
    let update = Update::decode_v1(update).map_err(|e| ConvertError::Apply {
        reason: e.to_string(),
    })?;
    let fragment = txn.get_or_insert_xml_fragment(DEFAULT_FRAGMENT);
    let len = fragment.len(&*txn);
    if len > 0 {
        fragment.remove_range(txn, 0, len);
    }
    txn.apply_update(update).map_err(|e| ConvertError::Apply {
        reason: e.to_string(),
    })
}
