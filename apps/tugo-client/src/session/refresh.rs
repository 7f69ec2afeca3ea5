//! Token refresh protocol: single flight inside a context, storage lock
//! across contexts.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use url::Url;

use crate::storage::KeyValueStore;

use super::lock::{
    now_ms, read_millis, write_millis, LockAttempt, RefreshLock, LAST_REFRESH_KEY,
    REFRESH_LOCK_KEY,
};
use super::signals::{RefreshSignal, RefreshSignals};

/// Refresh endpoint, relative to the backend origin.
pub const REFRESH_ENDPOINT: &str = "/api/v1/auth/refresh";

/// Timing knobs for the refresh protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    /// Age of the last refresh after which a preemptive refresh is due.
    pub refresh_threshold: Duration,
    /// Age after which a refresh lock is considered abandoned.
    pub lock_timeout: Duration,
    /// How long to wait on a lock held by another context.
    pub lock_wait: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(10 * 60),
            lock_timeout: Duration::from_secs(10),
            lock_wait: Duration::from_secs(1),
        }
    }
}

type InFlight = Shared<BoxFuture<'static, bool>>;

/// Cloneable handle on one context's refresh machinery.
#[derive(Clone)]
pub struct Refresher {
    inner: Arc<RefresherInner>,
}

struct RefresherInner {
    http: reqwest::Client,
    refresh_url: Url,
    store: Arc<dyn KeyValueStore>,
    lock: RefreshLock,
    signals: RefreshSignals,
    context_id: Arc<str>,
    settings: RefreshSettings,
    in_flight: Mutex<Option<InFlight>>,
}

impl Refresher {
    pub fn new(
        http: reqwest::Client,
        base_url: &Url,
        store: Arc<dyn KeyValueStore>,
        signals: RefreshSignals,
        settings: RefreshSettings,
    ) -> Result<Self, url::ParseError> {
        let context_id: Arc<str> =
            Arc::from(tugo_common::id::prefixed_ulid(tugo_common::id::prefix::CONTEXT));
        Ok(Self {
            inner: Arc::new(RefresherInner {
                http,
                refresh_url: base_url.join(REFRESH_ENDPOINT)?,
                lock: RefreshLock::new(store.clone(), settings.lock_timeout),
                store,
                signals,
                context_id,
                settings,
                in_flight: Mutex::new(None),
            }),
        })
    }

    pub fn context_id(&self) -> &str {
        &self.inner.context_id
    }

    pub fn settings(&self) -> RefreshSettings {
        self.inner.settings
    }

    /// Run the refresh protocol and report whether the session is usable.
    ///
    /// Concurrent callers in this context share one attempt and observe the
    /// same outcome. Once it settles the slot is cleared, so the next caller
    /// starts a fresh attempt.
    pub async fn refresh(&self) -> bool {
        let flight = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let weak: Weak<RefresherInner> = Arc::downgrade(&self.inner);
                    let flight = async move {
                        match weak.upgrade() {
                            Some(inner) => inner.settle().await,
                            None => false,
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Whether the last refresh is older than the threshold. A context that
    /// has never refreshed is always due.
    pub async fn should_refresh_preemptively(&self) -> bool {
        match read_millis(self.inner.store.as_ref(), LAST_REFRESH_KEY).await {
            Some(at) => now_ms()
                .checked_sub(at)
                .map_or(true, |age| age >= self.inner.settings.refresh_threshold.as_millis() as i64),
            None => true,
        }
    }

    /// Opportunistic refresh ahead of expiry. Returns `true` when nothing was
    /// due or the refresh succeeded.
    pub async fn refresh_if_stale(&self) -> bool {
        if !self.should_refresh_preemptively().await {
            return true;
        }
        tracing::debug!(context = %self.inner.context_id, "refreshing session preemptively");
        self.refresh().await
    }

    /// Stamp "refreshed now"; the credential was just issued.
    pub async fn mark_refreshed(&self) {
        write_millis(self.inner.store.as_ref(), LAST_REFRESH_KEY, now_ms()).await;
    }

    /// Forget every refresh key this client wrote.
    pub async fn clear(&self) {
        for key in [LAST_REFRESH_KEY, REFRESH_LOCK_KEY] {
            if let Err(err) = self.inner.store.del(key).await {
                tracing::warn!(%err, key, "failed to clear session key");
            }
        }
    }
}

impl RefresherInner {
    async fn settle(&self) -> bool {
        let ok = self.coordinate().await;
        *self.in_flight.lock() = None;
        ok
    }

    async fn coordinate(&self) -> bool {
        // Subscribe before reading the lock so a holder finishing in between
        // is not missed.
        let mut signals = self.signals.subscribe();

        match self.lock.try_acquire(now_ms()).await {
            LockAttempt::HeldElsewhere { age } => {
                tracing::debug!(
                    context = %self.context_id,
                    lock_age_ms = age.as_millis() as u64,
                    "refresh in progress elsewhere; waiting"
                );
                match RefreshSignals::wait_for_outcome(
                    &mut signals,
                    &self.context_id,
                    self.settings.lock_wait,
                )
                .await
                {
                    Some(ok) => ok,
                    None => {
                        // Nothing heard: the holder lives in another process
                        // or is slow. Assume it succeeded.
                        tracing::debug!(context = %self.context_id, "assuming foreign refresh succeeded");
                        true
                    }
                }
            }
            LockAttempt::Acquired => {
                self.signals.announce(&self.context_id, RefreshSignal::Started);
                let ok = self.call_refresh_endpoint().await;
                if ok {
                    write_millis(self.store.as_ref(), LAST_REFRESH_KEY, now_ms()).await;
                }
                self.lock.release().await;
                self.signals
                    .announce(&self.context_id, RefreshSignal::Finished { ok });
                ok
            }
        }
    }

    async fn call_refresh_endpoint(&self) -> bool {
        match self.http.post(self.refresh_url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(context = %self.context_id, "session refreshed");
                true
            }
            Ok(resp) => {
                tracing::warn!(
                    context = %self.context_id,
                    status = %resp.status(),
                    "session refresh rejected"
                );
                false
            }
            Err(err) => {
                tracing::warn!(context = %self.context_id, %err, "session refresh request failed");
                false
            }
        }
    }
}
