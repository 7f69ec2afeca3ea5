use reqwest::StatusCode;
use serde_json::Value;

/// A non-success HTTP response, carrying the backend's status and message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("HTTP {status}: {message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Build an error from a response body, preferring the backend's message.
    ///
    /// Accepts both `{ "message": … }` and `{ "error": { "message": … } }`;
    /// falls back to the status' canonical reason.
    pub fn from_body(status: StatusCode, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| backend_message(&v))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string()
            });
        Self { status, message }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }
}

fn backend_message(body: &Value) -> Option<String> {
    body.get("message")
        .or_else(|| body.get("error").and_then(|e| e.get("message")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Errors returned by the session client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

impl ClientError {
    /// HTTP status, when the backend answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Http(e) => Some(e.status),
            ClientError::Transport(e) => e.status(),
            _ => None,
        }
    }
}

/// Errors raised by a shared key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("storage unavailable")]
    Unavailable,
}

/// Errors raised by the realtime notes layer.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("realtime connection is not established")]
    NotConnected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid realtime URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Malformed SockJS or STOMP input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("unknown STOMP command `{0}`")]
    UnknownCommand(String),
    #[error("malformed header line `{0}`")]
    MalformedHeader(String),
    #[error("frame is missing its NUL terminator")]
    Unterminated,
    #[error("invalid escape sequence in header")]
    BadEscape,
    #[error("malformed SockJS frame: {0}")]
    SockJs(String),
}

/// Errors surfaced by [`crate::shell::NotesSession`].
#[derive(Debug, thiserror::Error)]
pub enum NotesError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}
