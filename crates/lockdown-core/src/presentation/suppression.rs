//! Allowed-app suppression state.
//!
//! While an allow-listed app is frontmost the blocking surface stays
//! attached but goes transparent and non-interactive. Suppression must be
//! refreshed; without a refresh within `stale_after` it lapses on its own.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Suppression {
    stale_after: Duration,
    refreshed_ms: Option<i64>,
}

impl Suppression {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            refreshed_ms: None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.refreshed_ms.is_some()
    }

    /// Record a refresh. Returns `true` when this turned suppression on.
    pub fn refresh(&mut self, now_ms: i64) -> bool {
        let was = self.is_suppressed();
        self.refreshed_ms = Some(now_ms);
        !was
    }

    /// Returns `true` when suppression was on.
    pub fn clear(&mut self) -> bool {
        self.refreshed_ms.take().is_some()
    }

    /// Lapse a stale suppression. Returns `true` when it lapsed now.
    pub fn expire_if_stale(&mut self, now_ms: i64) -> bool {
        let stale_ms = i64::try_from(self.stale_after.as_millis()).unwrap_or(i64::MAX);
        match self.refreshed_ms {
            Some(at) if now_ms.saturating_sub(at) >= stale_ms => {
                self.refreshed_ms = None;
                true
            }
            _ => false,
        }
    }
}
