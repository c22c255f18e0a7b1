//! Connection-less document sessions.

use std::sync::Arc;
use yrs::{Transact, TransactionMut};

use super::protocol::EMPTY_UPDATE;
use super::session::DocumentSession;
use super::{now, DocumentEngine, UpdateOrigin};
use collab_types::DocumentName;

/// A handle that keeps a document loaded and lets server code edit it.
///
/// Changes made through [`DirectSession::transact`] reach local viewers and
/// subscribers exactly like client edits. Call [`DirectSession::disconnect`]
/// when done so an idle document can be flushed and unloaded; dropping the
/// handle does the same in the background.
pub struct DirectSession {
    engine: Arc<DocumentEngine>,
    session: Arc<DocumentSession>,
    active: bool,
}

impl DirectSession {
    pub(super) fn new(engine: Arc<DocumentEngine>, session: Arc<DocumentSession>) -> Self {
        Self {
            engine,
            session,
            active: true,
        }
    }

    /// Document this session is open on.
    pub fn document(&self) -> &DocumentName {
        &self.session.name
    }

    /// Run `f` in one transaction under the session lock.
    ///
    /// No other reader or writer observes the document between the start
    /// and the end of `f`. The resulting delta is broadcast once the
    /// transaction commits.
    pub fn transact<R>(&self, f: impl FnOnce(&mut TransactionMut<'_>) -> R) -> R {
        let (result, delta, viewers) = {
            let mut state = self.session.lock();
            let (result, delta) = {
                let mut txn = state.doc.transact_mut();
                let result = f(&mut txn);
                (result, txn.encode_update_v1())
            };
            if delta == EMPTY_UPDATE {
                return result;
            }
            state.mark_changed(now());
            (result, delta, state.viewers_except(None))
        };
        self.engine
            .publish_change(&self.session, delta, viewers, UpdateOrigin::Local);
        result
    }

    /// End the session. If nothing else uses the document it is flushed
    /// and unloaded before this returns.
    pub async fn disconnect(mut self) {
        self.active = false;
        self.engine.release_direct(&self.session).await;
    }
}

impl Drop for DirectSession {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let idle = {
            let mut state = self.session.lock();
            state.direct = state.direct.saturating_sub(1);
            state.is_idle()
        };
        if idle {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let engine = Arc::clone(&self.engine);
                let session = Arc::clone(&self.session);
                handle.spawn(async move { engine.try_unload(&session).await });
            }
        }
    }
}

impl std::fmt::Debug for DirectSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectSession")
            .field("document", &self.session.name)
            .field("active", &self.active)
            .finish()
    }
}
