pub mod id;
pub mod models;
pub mod topics;

pub use models::{NoteMessage, Participant, ReadReceipt, Room, UnreadCount};
