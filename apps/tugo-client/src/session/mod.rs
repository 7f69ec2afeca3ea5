//! Session Client: credentialed HTTP with transparent token refresh.

pub mod client;
pub mod lock;
pub mod navigator;
pub mod refresh;
pub mod signals;

pub use client::{RequestOptions, SessionClient, SessionClientBuilder};
pub use lock::{LockAttempt, RefreshLock, LAST_REFRESH_KEY, REFRESH_LOCK_KEY};
pub use navigator::{login_url, LogNavigator, Navigator};
pub use refresh::{RefreshSettings, Refresher, REFRESH_ENDPOINT};
pub use signals::{RefreshSignal, RefreshSignals};
