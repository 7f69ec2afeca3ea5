//! Decoding of inbound note events.

use tugo_common::NoteMessage;

use super::stomp::Frame;

/// Decode a MESSAGE body as a note. Malformed payloads are logged and
/// dropped so a bad event never reaches subscribers.
pub fn decode_note(frame: &Frame) -> Option<NoteMessage> {
    match serde_json::from_str::<NoteMessage>(&frame.body) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(
                %err,
                destination = frame.get("destination").unwrap_or("?"),
                "dropping malformed note event"
            );
            None
        }
    }
}
