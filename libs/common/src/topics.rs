//! STOMP destinations used by the notes broker.

/// Per-user channel: one event per new message in any of the user's rooms.
pub fn user_channel(user_id: i64) -> String {
    format!("/sub/notes/user/{user_id}")
}

/// Per-room channel for a conversation that is open in the UI.
pub fn room_channel(room_id: i64) -> String {
    format!("/sub/notes/rooms/{room_id}")
}

/// Publish destination for sending a message into a room.
pub fn room_publish(room_id: i64) -> String {
    format!("/pub/rooms/{room_id}/messages")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_match_broker_layout() {
        assert_eq!(user_channel(7), "/sub/notes/user/7");
        assert_eq!(room_channel(42), "/sub/notes/rooms/42");
        assert_eq!(room_publish(42), "/pub/rooms/42/messages");
    }
}
