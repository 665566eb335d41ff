//! Gateway wire types for the HTTP surface (query strings, error bodies).

use crate::error::HubError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PROTOCOL_VERSION: u32 = 1;

/// `?token=` on WebSocket upgrades and HTTP routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Query for `POST /proxy/{deviceId}`: `?timeoutMs=&token=`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyQuery {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub token: Option<String>,
}

impl ProxyQuery {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// JSON body returned with every non-2xx proxy or auth response: `{ "error", "code" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl ErrorBody {
    pub fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
        }
    }
}

impl From<&HubError> for ErrorBody {
    fn from(err: &HubError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Interpret an HTTP body as a payload: JSON when it parses, otherwise the raw text (SDP is
/// often posted as plain text). An empty body is `null`.
pub fn payload_from_body(body: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(text.into_owned()))
}
