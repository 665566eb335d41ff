//! Envelope: the message unit exchanged over every channel.
//!
//! Wire shape: `{ "type", "target"?, "sender"?, "correlationId"?, "payload" }`.

use crate::error::HubError;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Known `type` tags. Anything else is [`EnvelopeKind::Other`] and relayed by target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    VideoFrame,
    ProxyRequest,
    ProxyResponse,
    FileChunk,
    Status,
    Error,
    Shutdown,
    Other,
}

impl EnvelopeKind {
    pub fn of(typ: &str) -> Self {
        match typ {
            "offer" => EnvelopeKind::Offer,
            "answer" => EnvelopeKind::Answer,
            "ice_candidate" => EnvelopeKind::IceCandidate,
            "video_frame" => EnvelopeKind::VideoFrame,
            "proxy_request" => EnvelopeKind::ProxyRequest,
            "proxy_response" => EnvelopeKind::ProxyResponse,
            "file_chunk" => EnvelopeKind::FileChunk,
            "status" => EnvelopeKind::Status,
            "error" => EnvelopeKind::Error,
            "shutdown" => EnvelopeKind::Shutdown,
            _ => EnvelopeKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice_candidate",
            EnvelopeKind::VideoFrame => "video_frame",
            EnvelopeKind::ProxyRequest => "proxy_request",
            EnvelopeKind::ProxyResponse => "proxy_response",
            EnvelopeKind::FileChunk => "file_chunk",
            EnvelopeKind::Status => "status",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Shutdown => "shutdown",
            EnvelopeKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Set by the router on every forwarded envelope; whatever the client put here is discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: serde_json::Value) -> Self {
        Self {
            typ: kind.as_str().to_string(),
            target: None,
            sender: None,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn kind(&self) -> EnvelopeKind {
        EnvelopeKind::of(&self.typ)
    }

    /// Parse one inbound frame. Anything that is not an object with a non-empty `type` is malformed.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| HubError::MalformedMessage(e.to_string()))?;
        if envelope.typ.trim().is_empty() {
            return Err(HubError::MalformedMessage("empty type".to_string()));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, HubError> {
        serde_json::to_string(self).map_err(|e| HubError::Internal(e.to_string()))
    }

    /// Synthetic `error` envelope reporting `err` back to whoever sent `original_type`.
    pub fn error(
        err: &HubError,
        original_type: Option<&str>,
        target: Option<&str>,
        correlation_id: Option<String>,
    ) -> Self {
        Envelope::new(
            EnvelopeKind::Error,
            json!({
                "code": err.code(),
                "message": err.to_string(),
                "target": target,
                "originalType": original_type,
            }),
        )
        .with_correlation_id(correlation_id)
    }
}
