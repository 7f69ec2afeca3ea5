//! Cross-context refresh lock kept in the shared key-value store.
//!
//! The store offers no compare-and-swap, so acquiring is a plain
//! read-then-write. Two contexts can both observe "no lock" and both proceed;
//! the lock only narrows that window. A holder that never releases is
//! reclaimed once its timestamp is older than the timeout.

use std::sync::Arc;
use std::time::Duration;

use crate::storage::KeyValueStore;

/// Millisecond timestamp of the last successful refresh.
pub const LAST_REFRESH_KEY: &str = "tugo.lastTokenRefresh";

/// Millisecond timestamp written by the context currently refreshing.
pub const REFRESH_LOCK_KEY: &str = "tugo.tokenRefreshLock";

/// Result of trying to take the refresh lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// This context now holds the lock and must release it.
    Acquired,
    /// Another context stamped the lock `age` ago and it has not expired.
    HeldElsewhere { age: Duration },
}

pub struct RefreshLock {
    store: Arc<dyn KeyValueStore>,
    timeout: Duration,
}

impl RefreshLock {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Take the lock unless a live one exists.
    ///
    /// A lock stamped in the future (clock skew) is reclaimed as well.
    pub async fn try_acquire(&self, now_ms: i64) -> LockAttempt {
        if let Some(stamped_at) = read_millis(self.store.as_ref(), REFRESH_LOCK_KEY).await {
            // An age that overflows is as unusable as a garbage stamp.
            let age = now_ms.checked_sub(stamped_at);
            if let Some(age) = age.filter(|a| (0..self.timeout.as_millis() as i64).contains(a)) {
                return LockAttempt::HeldElsewhere {
                    age: Duration::from_millis(age as u64),
                };
            }
            tracing::info!(age_ms = ?age, "reclaiming abandoned refresh lock");
        }

        write_millis(self.store.as_ref(), REFRESH_LOCK_KEY, now_ms).await;
        LockAttempt::Acquired
    }

    pub async fn release(&self) {
        if let Err(err) = self.store.del(REFRESH_LOCK_KEY).await {
            tracing::warn!(%err, "failed to release refresh lock");
        }
    }
}

/// Read a millisecond timestamp. Missing, unreadable or unparsable values
/// are all "no value".
pub(crate) async fn read_millis(store: &dyn KeyValueStore, key: &str) -> Option<i64> {
    match store.get(key).await {
        Ok(value) => value.and_then(|v| v.trim().parse().ok()),
        Err(err) => {
            tracing::warn!(%err, key, "shared storage read failed");
            None
        }
    }
}

pub(crate) async fn write_millis(store: &dyn KeyValueStore, key: &str, millis: i64) {
    if let Err(err) = store.set(key, &millis.to_string()).await {
        tracing::warn!(%err, key, "shared storage write failed");
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
