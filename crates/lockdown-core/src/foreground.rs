//! Foreground-app signal.
//!
//! The OS only offers a usage-event log that can be queried over a recent
//! window. [`ForegroundSignal`] turns that into a push-style stream: it polls
//! on a fixed interval and re-emits the last known frontmost package even
//! when the window held no new transition, so consumers always see a
//! current value.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ForegroundError;
use crate::storage::TimingConfig;

/// A "moved to foreground" entry from the usage log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub package: String,
    pub at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(package: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            package: package.into(),
            at,
        }
    }
}

/// Foreground-app query service.
pub trait ForegroundQuery: Send + Sync {
    /// Foreground transitions within the last `window`, in any order.
    fn query(&self, window: Duration) -> Result<Vec<UsageEvent>, ForegroundError>;
}

/// One tick of the foreground stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForegroundSample {
    Package(String),
    /// No signal this tick.
    Unavailable(ForegroundError),
}

/// Polling adapter over a [`ForegroundQuery`].
pub struct ForegroundSignal {
    query: Arc<dyn ForegroundQuery>,
    last_known: Mutex<Option<String>>,
    poll_interval: Duration,
    window: Duration,
    denied_backoff: Duration,
}

impl ForegroundSignal {
    pub fn new(query: Arc<dyn ForegroundQuery>, timing: &TimingConfig) -> Self {
        Self {
            query,
            last_known: Mutex::new(None),
            poll_interval: timing.foreground_poll(),
            window: timing.foreground_window(),
            denied_backoff: timing.permission_denied_backoff(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Transitions within `window`, oldest first.
    pub fn poll_recent(&self, window: Duration) -> Result<Vec<UsageEvent>, ForegroundError> {
        let mut events = self.query.query(window)?;
        events.sort_by_key(|e| e.at);
        Ok(events)
    }

    /// The frontmost package: the newest transition in the window, or the
    /// last one seen when the window is empty.
    pub fn current(&self) -> Result<Option<String>, ForegroundError> {
        let events = self.poll_recent(self.window)?;
        let mut last = self.last_known.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(newest) = events.into_iter().next_back() {
            *last = Some(newest.package);
        }
        Ok(last.clone())
    }

    pub fn last_known(&self) -> Option<String> {
        self.last_known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start the polling loop. It ends when `cancel` fires or the receiver
    /// is dropped.
    pub fn spawn_stream(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> (mpsc::Receiver<ForegroundSample>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let signal = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let (sample, delay) = match signal.current() {
                    Ok(Some(package)) => (Some(ForegroundSample::Package(package)), signal.poll_interval),
                    Ok(None) => (None, signal.poll_interval),
                    Err(ForegroundError::PermissionDenied) => {
                        tracing::warn!(
                            backoff_ms = signal.denied_backoff.as_millis() as u64,
                            "usage access denied, backing off"
                        );
                        (
                            Some(ForegroundSample::Unavailable(ForegroundError::PermissionDenied)),
                            signal.denied_backoff,
                        )
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "foreground query failed");
                        (Some(ForegroundSample::Unavailable(e)), signal.poll_interval)
                    }
                };

                if let Some(sample) = sample {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(sample) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tracing::debug!("foreground stream stopped");
        });
        (rx, handle)
    }
}
