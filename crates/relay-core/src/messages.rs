use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Server,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Server => "server",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "server" => Ok(Self::Server),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// A single chat message. Immutable once constructed; the history store
/// owns the persisted copy and in-flight delivery carries clones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "messageId")]
    id: MessageId,
    session_id: SessionId,
    content: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(deserialize_with = "crate::time::deserialize")]
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: SessionId, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            content: content.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn user(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageKind::User, content)
    }

    pub fn server(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageKind::Server, content)
    }

    /// Rebuild a message read back from storage.
    pub fn from_parts(
        id: MessageId,
        session_id: SessionId,
        kind: MessageKind,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            session_id,
            content,
            kind,
            timestamp,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_user(&self) -> bool {
        self.kind == MessageKind::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_and_server_constructors() {
        let sid = SessionId::new();
        let u = Message::user(sid.clone(), "hello");
        let s = Message::server(sid.clone(), "hi back");
        assert!(u.is_user());
        assert!(!s.is_user());
        assert_eq!(u.session_id(), &sid);
        assert_ne!(u.id(), s.id());
        assert!(u.timestamp() <= s.timestamp());
    }

    #[test]
    fn wire_field_names() {
        let msg = Message::user(SessionId::from_raw("s1"), "안녕하세요");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["type"], "user");
        assert_eq!(json["content"], "안녕하세요");
        assert!(json["messageId"].as_str().unwrap().starts_with("msg_"));
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn reads_offsetless_timestamps() {
        let raw = r#"{
            "messageId": "0f8fad5b-d9cb-469f-a165-70867728950e",
            "sessionId": "s1",
            "content": "hello",
            "type": "user",
            "timestamp": "2025-07-01T12:34:56.123456"
        }"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.id().as_str(), "0f8fad5b-d9cb-469f-a165-70867728950e");
        assert_eq!(msg.timestamp().to_rfc3339(), "2025-07-01T12:34:56.123456+00:00");
    }

    #[test]
    fn kind_parses_from_storage_strings() {
        assert_eq!("server".parse::<MessageKind>().unwrap(), MessageKind::Server);
        assert!("assistant".parse::<MessageKind>().is_err());
        assert_eq!(MessageKind::User.to_string(), "user");
    }
}
