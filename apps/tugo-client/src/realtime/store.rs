//! Realtime notes store: one connection per user, a personal channel, room
//! channels, an unread counter and a global "new note" callback.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tugo_common::{topics, NoteMessage};

use crate::error::RealtimeError;

use super::events::decode_note;
use super::stomp::Frame;
use super::transport::{Connector, FrameHandler, SessionListener, StompSession};

/// Receives decoded notes.
pub type MessageCallback = Arc<dyn Fn(NoteMessage) + Send + Sync>;

#[derive(Default)]
enum Link {
    #[default]
    Idle,
    Connecting,
    Open(Arc<dyn StompSession>),
}

#[derive(Default)]
struct StoreState {
    link: Link,
    /// Bumped on every connect and disconnect; listeners from an older
    /// generation are ignored.
    generation: u64,
    user_id: Option<i64>,
    connected: bool,
    user_subscription: Option<String>,
    rooms: HashMap<i64, String>,
    global_callback: Option<MessageCallback>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    state: Mutex<StoreState>,
    unread: watch::Sender<u64>,
}

/// Process-wide realtime notes state. Cheap to clone; clones share
/// everything.
#[derive(Clone)]
pub struct NotesStore {
    shared: Arc<Shared>,
}

impl NotesStore {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (unread, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                connector,
                state: Mutex::new(StoreState::default()),
                unread,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    /// Open the realtime connection for `user_id` and listen on their
    /// personal channel.
    ///
    /// A no-op while a connection for the same user is open or opening. A
    /// connection for a different user is torn down first.
    pub async fn connect(&self, user_id: i64) -> Result<(), RealtimeError> {
        let switching = {
            let state = self.shared.state.lock();
            match (&state.link, state.user_id) {
                (Link::Idle, _) => false,
                (_, Some(current)) if current == user_id => {
                    tracing::debug!(user_id, "notes connection already active");
                    return Ok(());
                }
                _ => true,
            }
        };
        if switching {
            tracing::info!(user_id, "switching notes user; closing previous connection");
            self.disconnect().await;
        }

        let generation = {
            let mut state = self.shared.state.lock();
            if !matches!(state.link, Link::Idle) {
                // A concurrent connect got there first.
                return Ok(());
            }
            state.generation += 1;
            state.link = Link::Connecting;
            state.user_id = Some(user_id);
            state.generation
        };

        let listener = Arc::new(StoreListener {
            shared: Arc::downgrade(&self.shared),
            generation,
            user_id,
        });

        match self.shared.connector.open(listener).await {
            Ok(session) => {
                let stale = {
                    let mut state = self.shared.state.lock();
                    if state.generation == generation && matches!(state.link, Link::Connecting) {
                        state.link = Link::Open(session.clone());
                        false
                    } else {
                        true
                    }
                };
                if stale {
                    tracing::debug!(user_id, "connection opened after teardown; closing it");
                    session.deactivate().await;
                }
                Ok(())
            }
            Err(err) => {
                let mut state = self.shared.state.lock();
                if state.generation == generation {
                    state.link = Link::Idle;
                    state.user_id = None;
                }
                tracing::warn!(user_id, %err, "failed to open notes connection");
                Err(err)
            }
        }
    }

    /// Drop every subscription and close the connection. Idempotent. The
    /// unread counter and global callback are kept.
    pub async fn disconnect(&self) {
        let (link, subscriptions) = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.connected = false;
            state.user_id = None;
            let mut ids: Vec<String> = state.rooms.drain().map(|(_, id)| id).collect();
            ids.extend(state.user_subscription.take());
            (std::mem::take(&mut state.link), ids)
        };

        match link {
            Link::Open(session) => {
                for id in &subscriptions {
                    session.unsubscribe(id);
                }
                session.deactivate().await;
                tracing::info!("notes connection closed");
            }
            // The pending connect sees the generation change and closes its
            // session itself.
            Link::Connecting => tracing::debug!("disconnect requested while connecting"),
            Link::Idle => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn user_id(&self) -> Option<i64> {
        self.shared.state.lock().user_id
    }

    pub fn has_user_subscription(&self) -> bool {
        self.shared.state.lock().user_subscription.is_some()
    }

    // -----------------------------------------------------------------------
    // Room channels
    // -----------------------------------------------------------------------

    /// Listen to a room's channel. Replaces any existing subscription for
    /// the room. Logs and does nothing when not connected.
    pub fn subscribe_room(&self, room_id: i64, callback: MessageCallback) {
        let mut state = self.shared.state.lock();
        let session = match (&state.link, state.connected) {
            (Link::Open(session), true) => session.clone(),
            _ => {
                tracing::warn!(room_id, "cannot subscribe to room: notes connection is down");
                return;
            }
        };

        if let Some(previous) = state.rooms.remove(&room_id) {
            session.unsubscribe(&previous);
        }

        let handler: FrameHandler = Arc::new(move |frame: &Frame| {
            if let Some(message) = decode_note(frame) {
                callback(message);
            }
        });
        let id = session.subscribe(&topics::room_channel(room_id), handler);
        tracing::debug!(room_id, subscription = %id, "subscribed to room");
        state.rooms.insert(room_id, id);
    }

    pub fn unsubscribe_room(&self, room_id: i64) {
        let mut state = self.shared.state.lock();
        let Some(id) = state.rooms.remove(&room_id) else {
            return;
        };
        if let Link::Open(session) = &state.link {
            session.unsubscribe(&id);
        }
        tracing::debug!(room_id, "unsubscribed from room");
    }

    /// Rooms with an active subscription, ascending.
    pub fn active_room_subscriptions(&self) -> Vec<i64> {
        let mut rooms: Vec<i64> = self.shared.state.lock().rooms.keys().copied().collect();
        rooms.sort_unstable();
        rooms
    }

    /// Publish a note to a room.
    pub fn send_message(&self, room_id: i64, content: &str) -> Result<(), RealtimeError> {
        let session = {
            let state = self.shared.state.lock();
            match (&state.link, state.connected) {
                (Link::Open(session), true) => session.clone(),
                _ => return Err(RealtimeError::NotConnected),
            }
        };
        let body = serde_json::json!({ "content": content }).to_string();
        session.publish(&topics::room_publish(room_id), &body)
    }

    // -----------------------------------------------------------------------
    // Global callback
    // -----------------------------------------------------------------------

    /// Install (or clear, with `None`) the callback fired for every note on
    /// the personal channel. The last one installed wins.
    pub fn set_global_message_callback(&self, callback: Option<MessageCallback>) {
        self.shared.state.lock().global_callback = callback;
    }

    // -----------------------------------------------------------------------
    // Unread counter
    // -----------------------------------------------------------------------

    pub fn unread_count(&self) -> u64 {
        *self.shared.unread.borrow()
    }

    /// Observe the counter; every change is published.
    pub fn watch_unread_count(&self) -> watch::Receiver<u64> {
        self.shared.unread.subscribe()
    }

    pub fn set_unread_count(&self, count: u64) {
        self.shared.unread.send_replace(count);
    }

    pub fn increment_unread_count(&self) {
        self.shared.unread.send_modify(|count| *count = count.saturating_add(1));
    }

    /// Decrease by `by`, flooring at zero.
    pub fn decrement_unread_count(&self, by: u64) {
        self.shared
            .unread
            .send_modify(|count| *count = count.saturating_sub(by));
    }
}

impl Shared {
    fn deliver_user_event(&self, frame: &Frame) {
        let callback = {
            let state = self.state.lock();
            if state.user_subscription.as_deref() != frame.get("subscription") {
                tracing::debug!("dropping event from a stale user subscription");
                return;
            }
            state.global_callback.clone()
        };

        let Some(message) = decode_note(frame) else {
            return;
        };

        self.unread.send_modify(|count| *count = count.saturating_add(1));
        if let Some(callback) = callback {
            callback(message);
        }
    }
}

struct StoreListener {
    shared: Weak<Shared>,
    generation: u64,
    user_id: i64,
}

impl SessionListener for StoreListener {
    fn on_connected(&self, session: &dyn StompSession) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        if state.generation != self.generation {
            return;
        }
        state.connected = true;

        // Exactly one personal subscription per connection.
        if let Some(previous) = state.user_subscription.take() {
            session.unsubscribe(&previous);
        }
        let weak = Arc::downgrade(&shared);
        let handler: FrameHandler = Arc::new(move |frame: &Frame| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver_user_event(frame);
            }
        });
        let id = session.subscribe(&topics::user_channel(self.user_id), handler);
        state.user_subscription = Some(id);
        tracing::info!(user_id = self.user_id, "notes connection established");
    }

    fn on_disconnected(&self, reason: &str) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        if state.generation != self.generation {
            return;
        }
        state.connected = false;
        tracing::warn!(user_id = self.user_id, %reason, "notes connection lost");
    }
}
