use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

pub const DEFAULT_USER_ID: &str = "anonymous";

/// How the in-memory session state came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Restored,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Restored => write!(f, "restored"),
        }
    }
}

/// Project stage a session is in. Stages only move forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    #[default]
    Topic,
    Data,
    Build,
    Deploy,
}

impl ProcessStatus {
    /// The following stage; `Deploy` stays put.
    pub fn next(self) -> Self {
        match self {
            Self::Topic => Self::Data,
            Self::Data => Self::Build,
            Self::Build | Self::Deploy => Self::Deploy,
        }
    }

    pub fn is_last(self) -> bool {
        self == Self::Deploy
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "TOPIC",
            Self::Data => "DATA",
            Self::Build => "BUILD",
            Self::Deploy => "DEPLOY",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral per-session bookkeeping held by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: SessionId,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    /// Number of user-authored messages.
    pub message_count: u64,
    pub status: SessionStatus,
    pub process_status: ProcessStatus,
}

impl SessionState {
    pub fn created(session_id: SessionId, user_id: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            created_at: Utc::now(),
            message_count: 0,
            status: SessionStatus::Created,
            process_status: ProcessStatus::Topic,
        }
    }

    /// State rebuilt from persisted history. Process status is not part of
    /// history, so a restored session always starts over at `Topic`.
    pub fn restored(session_id: SessionId, created_at: DateTime<Utc>, message_count: u64) -> Self {
        Self {
            session_id,
            user_id: DEFAULT_USER_ID.to_string(),
            created_at,
            message_count,
            status: SessionStatus::Restored,
            process_status: ProcessStatus::Topic,
        }
    }
}
