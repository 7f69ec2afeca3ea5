use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::realtime::TransportSettings;
use crate::session::RefreshSettings;

/// Client configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend origin (e.g. `https://tugo.example`). HTTP and SockJS share it.
    pub base_url: Url,
    /// User whose notes the CLI listens to.
    pub user_id: Option<i64>,
    /// File shared by every client process for refresh coordination.
    pub storage_path: PathBuf,
    pub refresh: RefreshSettings,
    pub transport: TransportSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let base_url = required_var("TUGO_BASE_URL");
        let base_url = Url::parse(&base_url)
            .unwrap_or_else(|e| panic!("TUGO_BASE_URL is not a valid URL: {e}"));

        let refresh_defaults = RefreshSettings::default();
        let transport_defaults = TransportSettings::default();

        Self {
            base_url,
            user_id: std::env::var("TUGO_USER_ID")
                .ok()
                .and_then(|v| v.parse().ok()),
            storage_path: std::env::var("TUGO_STORAGE_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tugo-storage.json")),
            refresh: RefreshSettings {
                refresh_threshold: secs_var("TUGO_REFRESH_THRESHOLD_SECS")
                    .unwrap_or(refresh_defaults.refresh_threshold),
                lock_timeout: millis_var("TUGO_REFRESH_LOCK_TIMEOUT_MS")
                    .unwrap_or(refresh_defaults.lock_timeout),
                lock_wait: millis_var("TUGO_REFRESH_LOCK_WAIT_MS")
                    .unwrap_or(refresh_defaults.lock_wait),
            },
            transport: TransportSettings {
                reconnect_delay: millis_var("TUGO_RECONNECT_DELAY_MS")
                    .unwrap_or(transport_defaults.reconnect_delay),
                heartbeat: millis_var("TUGO_HEARTBEAT_MS").unwrap_or(transport_defaults.heartbeat),
            },
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn millis_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

fn secs_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}
