//! Typed calls against the notes REST endpoints.

use serde::Serialize;
use tugo_common::{NoteMessage, ReadReceipt, Room, UnreadCount};

use crate::error::ClientError;
use crate::session::SessionClient;

pub const ROOMS_ENDPOINT: &str = "/api/v1/notes/rooms";
pub const UNREAD_COUNT_ENDPOINT: &str = "/api/v1/notes/unread-count";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenRoomRequest {
    target_user_id: i64,
}

#[derive(Clone)]
pub struct NotesApi {
    client: SessionClient,
}

impl NotesApi {
    pub fn new(client: SessionClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, ClientError> {
        Ok(self.client.get(ROOMS_ENDPOINT).await?.unwrap_or_default())
    }

    pub async fn room_messages(&self, room_id: i64) -> Result<Vec<NoteMessage>, ClientError> {
        let endpoint = format!("{ROOMS_ENDPOINT}/{room_id}/messages");
        Ok(self.client.get(&endpoint).await?.unwrap_or_default())
    }

    /// Open (or fetch the existing) room with `peer_user_id`.
    pub async fn open_room(&self, peer_user_id: i64) -> Result<Room, ClientError> {
        let body = OpenRoomRequest {
            target_user_id: peer_user_id,
        };
        self.client
            .post(ROOMS_ENDPOINT, &body)
            .await?
            .ok_or_else(|| missing_body(ROOMS_ENDPOINT))
    }

    pub async fn unread_count(&self) -> Result<u64, ClientError> {
        let count: Option<UnreadCount> = self.client.get(UNREAD_COUNT_ENDPOINT).await?;
        Ok(count.map(|c| c.count).unwrap_or(0))
    }

    /// Mark every note in the room read; returns how many changed state.
    pub async fn mark_room_read(&self, room_id: i64) -> Result<u64, ClientError> {
        let endpoint = format!("{ROOMS_ENDPOINT}/{room_id}/read");
        let receipt: Option<ReadReceipt> = self.client.patch(&endpoint).await?;
        Ok(receipt.map(|r| r.read_count).unwrap_or(0))
    }
}

fn missing_body(endpoint: &str) -> ClientError {
    let err = <serde_json::Error as serde::de::Error>::custom(format!(
        "{endpoint} returned no content"
    ));
    ClientError::Decode(err)
}
