//! Wire models shared by the REST API and the realtime broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The other side of a one-to-one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: i64,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
}

/// A conversation between the current user and one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: i64,
    pub peer: Participant,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

/// A single note. Immutable once the server has accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMessage {
    #[serde(alias = "id")]
    pub message_id: i64,
    pub room_id: i64,
    pub sender_id: i64,
    pub sender_nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_profile_image_url: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Body of `GET /api/v1/notes/unread-count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: u64,
}

/// Body of `PATCH /api/v1/notes/rooms/{id}/read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub read_count: u64,
}
