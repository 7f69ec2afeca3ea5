//! SockJS framing over a raw WebSocket.
//!
//! The server speaks in single-letter frames: `o` (open), `h` (heartbeat),
//! `a[...]` (a JSON array of messages) and `c[code,"reason"]` (close). The
//! client sends JSON arrays of strings.

use rand::distributions::Alphanumeric;
use rand::Rng;
use url::Url;

use crate::error::{FrameError, RealtimeError};

/// Endpoint the backend registers its STOMP broker under.
pub const ENDPOINT: &str = "ws-stomp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockJsFrame {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

pub fn parse(text: &str) -> Result<SockJsFrame, FrameError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| FrameError::SockJs("empty frame".to_string()))?;
    let payload = chars.as_str();

    match kind {
        'o' => Ok(SockJsFrame::Open),
        'h' => Ok(SockJsFrame::Heartbeat),
        'a' => serde_json::from_str::<Vec<String>>(payload)
            .map(SockJsFrame::Messages)
            .map_err(|e| FrameError::SockJs(e.to_string())),
        'm' => serde_json::from_str::<String>(payload)
            .map(|m| SockJsFrame::Messages(vec![m]))
            .map_err(|e| FrameError::SockJs(e.to_string())),
        'c' => serde_json::from_str::<(u16, String)>(payload)
            .map(|(code, reason)| SockJsFrame::Close { code, reason })
            .map_err(|e| FrameError::SockJs(e.to_string())),
        other => Err(FrameError::SockJs(format!("unknown frame type `{other}`"))),
    }
}

/// Wrap client payloads for the wire.
pub fn encode(payloads: &[String]) -> String {
    // Serializing a slice of strings cannot fail.
    serde_json::to_string(payloads).unwrap_or_else(|_| "[]".to_string())
}

/// Build a fresh `ws(s)://…/ws-stomp/{server}/{session}/websocket` URL.
pub fn websocket_url(base: &Url) -> Result<Url, RealtimeError> {
    let mut rng = rand::thread_rng();
    let server_id: u16 = rng.gen_range(0..1000);
    let session_id: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    websocket_url_with(base, server_id, &session_id)
}

pub fn websocket_url_with(
    base: &Url,
    server_id: u16,
    session_id: &str,
) -> Result<Url, RealtimeError> {
    let mut root = base.clone();
    if !root.path().ends_with('/') {
        let path = format!("{}/", root.path());
        root.set_path(&path);
    }
    let mut url = root.join(&format!("{ENDPOINT}/{server_id:03}/{session_id}/websocket"))?;

    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RealtimeError::Handshake(format!(
                "unsupported scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RealtimeError::Handshake(format!("cannot switch to `{scheme}`")))?;
    Ok(url)
}
