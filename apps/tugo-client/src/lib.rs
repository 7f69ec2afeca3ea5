pub mod api;
pub mod config;
pub mod error;
pub mod realtime;
pub mod session;
pub mod shell;
pub mod storage;

pub use error::{ClientError, NotesError, RealtimeError};
pub use realtime::NotesStore;
pub use session::SessionClient;
pub use shell::NotesSession;
