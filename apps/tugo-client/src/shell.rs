//! Per-login composition of the session client, notes API and realtime store.

use std::sync::Arc;

use dashmap::DashMap;
use tugo_common::Room;

use crate::api::NotesApi;
use crate::error::NotesError;
use crate::realtime::{Connector, MessageCallback, NotesStore};
use crate::session::SessionClient;

/// Everything one logged-in user needs. Build it at login and call
/// [`NotesSession::shutdown`] at logout.
pub struct NotesSession {
    client: SessionClient,
    api: NotesApi,
    store: NotesStore,
    rooms: DashMap<i64, Room>,
}

impl NotesSession {
    pub fn new(client: SessionClient, connector: Arc<dyn Connector>) -> Self {
        Self {
            api: NotesApi::new(client.clone()),
            store: NotesStore::new(connector),
            client,
            rooms: DashMap::new(),
        }
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    pub fn api(&self) -> &NotesApi {
        &self.api
    }

    pub fn store(&self) -> &NotesStore {
        &self.store
    }

    /// Go live for `user_id`: stamp the fresh login, open the realtime
    /// connection and seed the unread counter from the backend.
    pub async fn start(&self, user_id: i64) -> Result<(), NotesError> {
        self.client.mark_refreshed().await;
        self.store.connect(user_id).await?;

        // The socket is already useful without the seed; keep going.
        match self.api.unread_count().await {
            Ok(count) => self.store.set_unread_count(count),
            Err(err) => tracing::warn!(user_id, %err, "failed to load unread count"),
        }

        tracing::info!(user_id, unread = self.store.unread_count(), "notes session started");
        Ok(())
    }

    /// Fetch the room list and replace the cache with it.
    pub async fn rooms(&self) -> Result<Vec<Room>, NotesError> {
        let rooms = self.api.list_rooms().await?;
        self.rooms.clear();
        for room in &rooms {
            self.rooms.insert(room.room_id, room.clone());
        }
        Ok(rooms)
    }

    pub fn cached_room(&self, room_id: i64) -> Option<Room> {
        self.rooms.get(&room_id).map(|r| r.clone())
    }

    /// Open (or reuse) the room with `peer_user_id` and cache it.
    pub async fn start_conversation(&self, peer_user_id: i64) -> Result<Room, NotesError> {
        let room = self.api.open_room(peer_user_id).await?;
        self.rooms.insert(room.room_id, room.clone());
        Ok(room)
    }

    pub fn open_room_view(&self, room_id: i64, callback: MessageCallback) {
        self.store.subscribe_room(room_id, callback);
    }

    pub fn close_room_view(&self, room_id: i64) {
        self.store.unsubscribe_room(room_id);
    }

    pub fn send(&self, room_id: i64, content: &str) -> Result<(), NotesError> {
        Ok(self.store.send_message(room_id, content)?)
    }

    /// Mark a room read and take its notes off the unread counter.
    pub async fn mark_room_read(&self, room_id: i64) -> Result<u64, NotesError> {
        let read = self.api.mark_room_read(room_id).await?;
        self.store.decrement_unread_count(read);
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.unread_count = 0;
        }
        tracing::debug!(room_id, read, "room marked read");
        Ok(read)
    }

    /// Call when the application comes back to the foreground.
    pub async fn on_visible(&self) -> bool {
        self.client.refresh_if_stale().await
    }

    /// Close the realtime connection, end the server session and drop the
    /// room cache.
    pub async fn shutdown(&self) {
        self.store.disconnect().await;
        self.client.logout().await;
        self.rooms.clear();
        tracing::info!("notes session closed");
    }
}
