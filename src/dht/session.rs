//! Cancellation scopes.
//!
//! A [`Session`] groups in-flight requests and queries so they can be
//! aborted together. Handles attach when they start and detach (by dropping
//! their [`Attachment`]) when they complete.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::error::DhtError;

/// Something a session can abort.
pub(crate) trait Abort: Send + Sync {
    fn abort(&self, err: DhtError);
}

struct Entry {
    key: u64,
    handle: Arc<dyn Abort>,
}

#[derive(Default)]
struct SessionState {
    entries: Vec<Entry>,
    positions: HashMap<u64, usize>,
    next_key: u64,
    destroyed: bool,
}

impl SessionState {
    fn detach(&mut self, key: u64) {
        let Some(pos) = self.positions.remove(&key) else {
            return;
        };
        self.entries.swap_remove(pos);
        if let Some(moved) = self.entries.get(pos) {
            self.positions.insert(moved.key, pos);
        }
    }
}

/// A cancellation scope for requests and queries.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, handle: Arc<dyn Abort>) -> Result<Attachment, DhtError> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Err(DhtError::RequestCancelled);
        }

        let key = state.next_key;
        state.next_key += 1;
        let pos = state.entries.len();
        state.entries.push(Entry { key, handle });
        state.positions.insert(key, pos);

        Ok(Attachment {
            session: Arc::downgrade(&self.inner),
            key,
        })
    }

    /// Number of attached in-flight operations.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Aborts everything attached with [`DhtError::RequestCancelled`].
    pub fn destroy(&self) {
        self.destroy_with(DhtError::RequestCancelled);
    }

    /// Aborts every attached operation exactly once with `err`.
    ///
    /// Later attachments are refused.
    pub fn destroy_with(&self, err: DhtError) {
        let mut entries = {
            let mut state = self.inner.lock();
            state.destroyed = true;
            state.positions.clear();
            std::mem::take(&mut state.entries)
        };

        // Aborting runs outside the lock; handles detach as they unwind.
        while let Some(entry) = entries.pop() {
            entry.handle.abort(err.clone());
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Session")
            .field("attached", &state.entries.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// Membership of one operation in a session. Dropping it detaches.
pub(crate) struct Attachment {
    session: Weak<Mutex<SessionState>>,
    key: u64,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.lock().detach(self.key);
        }
    }
}
