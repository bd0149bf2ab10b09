//! Window tracking over a counter store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use super::key::WindowKey;
use crate::error::{Result, TollgateError};
use crate::store::{CounterStore, Lifetime};

/// Count and remaining lifetime of a window after one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Trials seen in the current window, including this one
    pub count: i64,
    /// Time until the window closes
    pub reset: Duration,
}

/// Records trials against fixed windows held in a [`CounterStore`].
///
/// A trial is two steps. The first creates the window with a lifetime of one
/// period, or increments it if it already exists; the store's conditional
/// create decides which caller opens a window. The second reads the
/// remaining lifetime. A window found without an expiry is given one; a
/// window that is gone by the second step is reported as
/// [`TollgateError::WindowVanished`] instead of being recreated.
#[derive(Clone)]
pub struct WindowTracker {
    store: Arc<dyn CounterStore>,
    period: Duration,
}

impl WindowTracker {
    /// Create a tracker for windows of `period` length.
    pub fn new(store: Arc<dyn CounterStore>, period: Duration) -> Self {
        Self { store, period }
    }

    /// The window length.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Record one trial against `key`.
    pub async fn track(&self, key: &WindowKey) -> Result<WindowState> {
        let count = self.trial(key).await?;
        let reset = self.lifetime(key).await?;
        Ok(WindowState { count, reset })
    }

    async fn trial(&self, key: &WindowKey) -> Result<i64> {
        if self
            .store
            .create_if_absent(key.as_str(), 1, self.period)
            .await?
        {
            trace!(key = %key, "Opened new window");
            return Ok(1);
        }
        self.store.increment(key.as_str()).await
    }

    async fn lifetime(&self, key: &WindowKey) -> Result<Duration> {
        match self.store.remaining_lifetime(key.as_str()).await? {
            Lifetime::Expires(reset) => Ok(reset),
            Lifetime::NoExpiry => {
                if self.store.set_lifetime(key.as_str(), self.period).await? {
                    warn!(
                        key = %key,
                        period_ms = self.period.as_millis() as u64,
                        "Window had no expiry, restored it"
                    );
                    Ok(self.period)
                } else {
                    warn!(key = %key, "Window vanished while restoring its expiry");
                    Err(TollgateError::WindowVanished {
                        key: key.to_string(),
                    })
                }
            }
            Lifetime::Absent => {
                warn!(key = %key, "Window vanished before its lifetime was read");
                Err(TollgateError::WindowVanished {
                    key: key.to_string(),
                })
            }
        }
    }
}
