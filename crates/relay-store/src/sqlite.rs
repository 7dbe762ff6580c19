use tracing::instrument;

use relay_core::{Message, MessageId, MessageKind, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::history::HistoryStore;
use crate::row_helpers;

/// History store backed by the `messages` table.
pub struct SqliteHistoryStore {
    db: Database,
}

impl SqliteHistoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of persisted messages for a session.
    pub fn count(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    #[instrument(skip(self, message), fields(session_id = %session_id, message_id = %message.id()))]
    fn append(&self, session_id: &SessionId, message: &Message) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), -1) + 1 FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (id, session_id, sequence, kind, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    message.id().as_str(),
                    session_id.as_str(),
                    sequence,
                    message.kind().as_str(),
                    message.content(),
                    message.timestamp().to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn read_all(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, content, timestamp FROM messages
                 WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "messages", "id")?;
                let kind: String = row_helpers::get(row, 1, "messages", "kind")?;
                let content: String = row_helpers::get(row, 2, "messages", "content")?;
                let timestamp: String = row_helpers::get(row, 3, "messages", "timestamp")?;
                messages.push(Message::from_parts(
                    MessageId::from_raw(id),
                    session_id.clone(),
                    row_helpers::parse_enum::<MessageKind>(&kind, "messages", "kind")?,
                    content,
                    row_helpers::parse_timestamp(&timestamp, "messages", "timestamp")?,
                ));
            }
            Ok(messages)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id FROM messages GROUP BY session_id ORDER BY MIN(rowid) ASC",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(SessionId::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}
