use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ids::SessionId;
use crate::messages::Message;
use crate::session::ProcessStatus;

pub const CONNECTED_NOTICE: &str = "Event stream connected.";

/// One queued item on a session's delivery channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub message: Message,
    /// 1-based position within the producing job.
    pub sequence: u32,
    pub total: u32,
    pub original_message: String,
    /// Process status captured when the job was submitted.
    pub process_status: ProcessStatus,
}

/// Events emitted to an attached stream consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Connected {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },
    Message(DeliveryPayload),
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn connected(session_id: SessionId) -> Self {
        Self::Connected {
            session_id,
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    /// Discriminator used as the SSE `event:` name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Message(_) => "message",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Connected { timestamp, .. } | Self::Heartbeat { timestamp } => *timestamp,
            Self::Message(payload) => payload.message.timestamp(),
        }
    }

    /// JSON body carried in the SSE `data:` field.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Connected { session_id, timestamp } => json!({
                "sessionId": session_id,
                "message": CONNECTED_NOTICE,
                "timestamp": timestamp.to_rfc3339(),
            }),
            Self::Message(p) => json!({
                "type": "chat_response",
                "sessionId": p.message.session_id(),
                "messageId": p.message.id(),
                "content": p.message.content(),
                "sequence": p.sequence,
                "total": p.total,
                "originalMessage": p.original_message,
                "processStatus": p.process_status,
                "timestamp": p.message.timestamp().to_rfc3339(),
            }),
            Self::Heartbeat { timestamp } => json!({
                "timestamp": timestamp.to_rfc3339(),
            }),
        }
    }
}
