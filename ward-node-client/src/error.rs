use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced by the wallet node client.
#[derive(Debug, Error)]
pub enum NodeApiError {
    /// The node replied with a non-2xx status.
    /// `code` comes from the error envelope when present, the HTTP status
    /// otherwise; `message` is the envelope's `error` field or the raw body.
    #[error("node error {code}: {message}")]
    Node { code: u16, message: String },

    /// The request never produced an HTTP response (connect failure,
    /// timeout, protocol error).
    #[error("node request failed: {0}")]
    Transport(String),

    /// A 2xx reply whose body couldn't be decoded into the expected type.
    #[error("invalid node response: {0}")]
    InvalidResponse(String),
}

/// The node's JSON error envelope: `{ "error": ..., "code": ... }`.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

impl NodeApiError {
    /// Build the uniform error from a non-2xx status and raw body bytes.
    pub(crate) fn from_response(status: u16, body: &[u8]) -> Self {
        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
            if envelope.error.is_some() || envelope.code.is_some() {
                let message = envelope
                    .error
                    .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
                return Self::Node {
                    code: envelope.code.unwrap_or(status),
                    message,
                };
            }
        }
        let body_text = String::from_utf8_lossy(body);
        let message = if body_text.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body_text.into_owned()
        };
        Self::Node {
            code: status,
            message,
        }
    }

    /// Whether the node client should retry the request inline.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Node { code, .. } => matches!(code, 429 | 500 | 502 | 503 | 504),
            Self::Transport(_) => true,
            Self::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for NodeApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}
