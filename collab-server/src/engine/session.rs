//! Per-document in-memory state.

use collab_core::DebounceState;
use collab_types::{ConnectionId, DocumentName};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::OnceCell;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact};

use crate::adapter::SocketAdapter;

/// Name of the XML fragment rich-text editors bind to.
pub const DEFAULT_FRAGMENT: &str = "default";

/// One loaded document. At most one per name per instance.
pub(crate) struct DocumentSession {
    pub(crate) name: DocumentName,
    state: Mutex<SessionState>,
    /// Initialized once the stored snapshot has been applied.
    pub(crate) loaded: OnceCell<()>,
    /// Serializes snapshot writes.
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
}

/// Everything guarded by the session lock, CRDT document included.
pub(crate) struct SessionState {
    pub(crate) doc: Doc,
    pub(crate) viewers: HashMap<ConnectionId, Arc<SocketAdapter>>,
    pub(crate) direct: usize,
    pub(crate) debounce: DebounceState,
    pub(crate) closed: bool,
    pub(crate) persist_scheduled: bool,
    pub(crate) last_mutation: Option<Instant>,
}

impl DocumentSession {
    pub(crate) fn new(name: DocumentName) -> Self {
        Self {
            name,
            state: Mutex::new(SessionState {
                doc: Doc::new(),
                viewers: HashMap::new(),
                direct: 0,
                debounce: DebounceState::new(),
                closed: false,
                persist_scheduled: false,
                last_mutation: None,
            }),
            loaded: OnceCell::new(),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Lock the session state. Never held across an await.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("name", &self.name)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl SessionState {
    /// No viewers and no direct sessions.
    pub(crate) fn is_idle(&self) -> bool {
        self.viewers.is_empty() && self.direct == 0
    }

    pub(crate) fn mark_changed(&mut self, now: Instant) {
        self.debounce.record_change(now);
        self.last_mutation = Some(now);
    }

    /// Sockets of every viewer except `exclude`.
    pub(crate) fn viewers_except(&self, exclude: Option<&ConnectionId>) -> Vec<Arc<SocketAdapter>> {
        self.viewers
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .map(|(_, socket)| Arc::clone(socket))
            .collect()
    }

    pub(crate) fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Full document state as one v1 update.
    pub(crate) fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// What a peer at `since` is missing.
    pub(crate) fn encode_diff(&self, since: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(since)
    }

    pub(crate) fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// XML serialization of the default fragment.
    pub(crate) fn content_xml(&self) -> String {
        let fragment = self.doc.get_or_insert_xml_fragment(DEFAULT_FRAGMENT);
        let txn = self.doc.transact();
        fragment.get_string(&txn)
    }
}
