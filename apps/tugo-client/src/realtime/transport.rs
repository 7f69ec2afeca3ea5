//! Seams between the notes store and the STOMP connection underneath it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RealtimeError;

use super::stomp::Frame;

/// Callback invoked for every MESSAGE frame on a subscription.
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Lifecycle callbacks from a session to its owner.
pub trait SessionListener: Send + Sync {
    /// The broker accepted CONNECT. Fires again after every reconnect.
    fn on_connected(&self, session: &dyn StompSession);
    /// The connection dropped; a reconnect is scheduled unless deactivated.
    fn on_disconnected(&self, reason: &str);
}

/// A STOMP session that survives reconnects.
///
/// Subscriptions are registrations: they stay in force across a reconnect
/// and are replayed to the broker before `on_connected` fires.
#[async_trait]
pub trait StompSession: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Register `handler` for `destination` and return the subscription id.
    fn subscribe(&self, destination: &str, handler: FrameHandler) -> String;

    fn unsubscribe(&self, id: &str);

    /// Send a JSON body to an application destination.
    fn publish(&self, destination: &str, body: &str) -> Result<(), RealtimeError>;

    /// Disconnect and stop reconnecting.
    async fn deactivate(&self);
}

/// Opens sessions. The session connects in the background; `open` returns
/// as soon as it is running.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Arc<dyn StompSession>, RealtimeError>;
}
