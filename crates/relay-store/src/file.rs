//! One JSON document per session under a data directory.
//!
//! Layout of `<dir>/<session_id>.json`:
//! `{"sessionId": ..., "messages": [...], "lastUpdated": ...}`.
//! Writes go to a temporary sibling and are renamed into place, so readers
//! never see a half-written document.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use relay_core::{Message, SessionId};

use crate::error::StoreError;
use crate::history::{HistoryStore, SessionLocks};

const EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatDocument {
    session_id: SessionId,
    messages: Vec<Message>,
    #[serde(deserialize_with = "relay_core::time::deserialize")]
    last_updated: DateTime<Utc>,
}

pub struct JsonFileHistoryStore {
    dir: PathBuf,
    locks: SessionLocks,
}

impl JsonFileHistoryStore {
    /// Open (creating if needed) a history directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        Ok(Self {
            dir,
            locks: SessionLocks::new(),
        })
    }

    fn document_path(&self, session_id: &SessionId) -> Result<PathBuf, StoreError> {
        validate_key(session_id.as_str())?;
        Ok(self.dir.join(format!("{session_id}.{EXTENSION}")))
    }

    fn load(path: &Path) -> Result<Option<ChatDocument>, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write under the session lock. Returns the new length.
    fn append_locked(
        path: &Path,
        session_id: &SessionId,
        message: &Message,
    ) -> Result<usize, StoreError> {
        let mut doc = Self::load(path)?.unwrap_or_else(|| ChatDocument {
            session_id: session_id.clone(),
            messages: Vec::new(),
            last_updated: Utc::now(),
        });
        doc.messages.push(message.clone());
        doc.last_updated = Utc::now();
        Self::store(path, &doc)?;
        Ok(doc.messages.len())
    }

    fn store(path: &Path, doc: &ChatDocument) -> Result<(), StoreError> {
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        let bytes = serde_json::to_vec_pretty(doc)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Session ids become file names; reject anything that could leave the
/// directory or collide with temp files.
fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key.len() <= 200
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

impl HistoryStore for JsonFileHistoryStore {
    #[instrument(skip(self, message), fields(session_id = %session_id, message_id = %message.id()))]
    fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), StoreError> {
        let path = self.document_path(session_id)?;
        let saved = {
            let lock = self.locks.get(session_id);
            let _guard = lock.lock();
            Self::append_locked(&path, session_id, message)
        };
        self.locks.release(session_id);

        let count = saved?;
        debug!(count, "chat message saved");
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn read_all(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        let path = self.document_path(session_id)?;
        let loaded = {
            let lock = self.locks.get(session_id);
            let _guard = lock.lock();
            Self::load(&path)
        };
        self.locks.release(session_id);

        Ok(loaded?.map(|doc| doc.messages).unwrap_or_default())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let path = self.document_path(session_id)?;
        let removed = {
            let lock = self.locks.get(session_id);
            let _guard = lock.lock();
            match std::fs::remove_file(&path) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            }
        };
        self.locks.release(session_id);
        Ok(removed)
    }

    fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(SessionId::from_raw(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
