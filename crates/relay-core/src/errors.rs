/// Error taxonomy shared by the delivery core and its boundary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Operation needs in-memory session state that does not exist.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Push against a deregistered or saturated channel.
    #[error("channel unavailable for {session_id}: {reason}")]
    ChannelUnavailable { session_id: String, reason: String },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Missing or invalid input at the boundary. Nothing was mutated.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl RelayError {
    /// Short classification string for logging and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ChannelUnavailable { .. } => "channel_unavailable",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::MalformedRequest(_) => "malformed_request",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::MalformedRequest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings() {
        assert_eq!(RelayError::NotFound("s".into()).kind(), "not_found");
        assert_eq!(
            RelayError::ChannelUnavailable {
                session_id: "s".into(),
                reason: "closed".into()
            }
            .kind(),
            "channel_unavailable"
        );
        assert_eq!(RelayError::PersistenceFailure("io".into()).kind(), "persistence_failure");
        assert_eq!(RelayError::MalformedRequest("x".into()).kind(), "malformed_request");
    }

    #[test]
    fn client_error_classification() {
        assert!(RelayError::MalformedRequest("missing message".into()).is_client_error());
        assert!(RelayError::NotFound("s".into()).is_client_error());
        assert!(!RelayError::PersistenceFailure("disk full".into()).is_client_error());
    }

    #[test]
    fn display_includes_detail() {
        let e = RelayError::ChannelUnavailable {
            session_id: "sess_1".into(),
            reason: "queue full".into(),
        };
        assert_eq!(e.to_string(), "channel unavailable for sess_1: queue full");
    }
}
