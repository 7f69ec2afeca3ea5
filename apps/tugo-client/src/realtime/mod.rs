pub mod events;
pub mod sockjs;
pub mod stomp;
pub mod store;
pub mod transport;
pub mod ws;

use std::time::Duration;

pub use store::{MessageCallback, NotesStore};
pub use transport::{Connector, FrameHandler, SessionListener, StompSession};
pub use ws::{SockJsConnector, WsStompSession};

/// Connection timing for the realtime transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Outgoing STOMP heart-beat interval, also offered to the broker. Zero
    /// disables heart-beats in both directions.
    pub heartbeat: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            heartbeat: Duration::from_secs(10),
        }
    }
}
