//! Broadcast hub announcing refresh progress to every context in the process.
//!
//! The storage lock says *that* someone is refreshing; this hub says *how it
//! ended*. A context that finds the lock taken waits here for the holder's
//! outcome instead of guessing. Contexts in other processes never see these
//! signals and fall back to the lock's optimistic wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Refresh signals are rare; a lagging
/// receiver only loses stale progress reports.
const SIGNAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSignal {
    Started,
    Finished { ok: bool },
}

/// A signal tagged with the context that sent it.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub origin: Arc<str>,
    pub signal: RefreshSignal,
}

/// Cloneable handle; give every context in the process the same one.
#[derive(Clone)]
pub struct RefreshSignals {
    sender: broadcast::Sender<SignalEnvelope>,
}

impl Default for RefreshSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshSignals {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEnvelope> {
        self.sender.subscribe()
    }

    pub fn announce(&self, origin: &Arc<str>, signal: RefreshSignal) {
        // send() returns Err if there are no receivers; that's fine.
        let _ = self.sender.send(SignalEnvelope {
            origin: origin.clone(),
            signal,
        });
    }

    /// Wait up to `wait` for another context's `Finished` signal.
    ///
    /// Returns `None` when the wait elapses or the hub is gone.
    pub async fn wait_for_outcome(
        rx: &mut broadcast::Receiver<SignalEnvelope>,
        own_origin: &str,
        wait: Duration,
    ) -> Option<bool> {
        let outcome = tokio::time::timeout(wait, async {
            loop {
                match rx.recv().await {
                    Ok(envelope) if &*envelope.origin == own_origin => continue,
                    Ok(SignalEnvelope {
                        signal: RefreshSignal::Finished { ok },
                        ..
                    }) => return Some(ok),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "refresh signal receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        outcome.ok().flatten()
    }
}
