//! Hub error taxonomy. Every variant is scoped to the connections involved; none is fatal.

/// Errors raised while routing, correlating, or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Route or issue addressed to an id with no live connection.
    #[error("target not found: {0}")]
    TargetNotFound(String),
    /// Correlator deadline elapsed before a response arrived.
    #[error("timed out waiting for a response from {0}")]
    Timeout(String),
    /// The connection a caller was waiting on went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("stale response for correlation {0}")]
    StaleResponse(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Stable code carried in `error` envelopes and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::TargetNotFound(_) => "target_not_found",
            HubError::Timeout(_) => "timeout",
            HubError::ConnectionLost(_) => "connection_lost",
            HubError::MalformedMessage(_) => "malformed_message",
            HubError::StaleResponse(_) => "stale_response",
            HubError::Internal(_) => "internal",
        }
    }
}
