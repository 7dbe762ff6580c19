use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{Message, SessionId};

use crate::error::StoreError;

/// Durable, append-only message log keyed by session.
///
/// Implementations must make `append` and `read_all` atomic with respect to
/// each other for the same session; different sessions may proceed in
/// parallel.
pub trait HistoryStore: Send + Sync {
    /// Append one message to the end of the session's history.
    fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), StoreError>;

    /// All messages for a session in append order. Unknown sessions yield an
    /// empty vector.
    fn read_all(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError>;

    /// Purge a session's history. Returns whether anything was removed.
    fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    /// Sessions that currently have persisted history.
    fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError>;
}

/// Per-session lock table for read-modify-write linearization.
pub(crate) struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody else holds it.
    pub(crate) fn release(&self, session_id: &SessionId) {
        let mut locks = self.locks.lock();
        let idle = locks
            .get(session_id.as_str())
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(session_id.as_str());
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
