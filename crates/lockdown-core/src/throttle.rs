//! Per-key debounce ledger.
//!
//! `should_trigger(domain, key)` answers "has at least `interval(domain)`
//! passed since the last accepted event for `key`?" and records the new
//! event when it has. The read and the write happen under one mutex, so
//! exactly one of several concurrent callers wins each interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::storage::EngineConfig;

/// Independent debounce domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleDomain {
    /// Re-showing the overlay over an ordinary app.
    OverlayForce,
    /// Raising the blocking surface over a settings surface.
    UiRedirect,
    /// Redirecting into the emergency-unlock surface.
    EmergencyRedirect,
    /// Asking the overlay to go inert while an allowed app is frontmost.
    AllowedSuppress,
    /// Re-arming a process restart for one logical target.
    ProcessRestart,
}

impl ThrottleDomain {
    pub const ALL: [ThrottleDomain; 5] = [
        ThrottleDomain::OverlayForce,
        ThrottleDomain::UiRedirect,
        ThrottleDomain::EmergencyRedirect,
        ThrottleDomain::AllowedSuppress,
        ThrottleDomain::ProcessRestart,
    ];
}

/// Interval per domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleIntervals {
    intervals: HashMap<ThrottleDomain, Duration>,
}

impl ThrottleIntervals {
    pub fn from_config(config: &EngineConfig) -> Self {
        let t = &config.timing;
        let ms = Duration::from_millis;
        let intervals = HashMap::from([
            (ThrottleDomain::OverlayForce, ms(t.overlay_force_throttle_ms)),
            (ThrottleDomain::UiRedirect, ms(t.ui_redirect_throttle_ms)),
            (ThrottleDomain::EmergencyRedirect, ms(t.emergency_redirect_throttle_ms)),
            (ThrottleDomain::AllowedSuppress, ms(t.allowed_suppress_throttle_ms)),
            (
                ThrottleDomain::ProcessRestart,
                Duration::from_secs(config.schedule.process_restart_min_interval_secs),
            ),
        ]);
        Self { intervals }
    }

    pub fn with(mut self, domain: ThrottleDomain, interval: Duration) -> Self {
        self.intervals.insert(domain, interval);
        self
    }

    pub fn get(&self, domain: ThrottleDomain) -> Duration {
        self.intervals.get(&domain).copied().unwrap_or(Duration::ZERO)
    }
}

impl Default for ThrottleIntervals {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Last accepted trigger per `(domain, key)`, in monotonic milliseconds.
pub struct ThrottleLedger {
    intervals: ThrottleIntervals,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<(ThrottleDomain, String), i64>>,
}

impl ThrottleLedger {
    pub fn new(intervals: ThrottleIntervals, clock: Arc<dyn Clock>) -> Self {
        Self {
            intervals,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self, domain: ThrottleDomain) -> Duration {
        self.intervals.get(domain)
    }

    pub fn should_trigger(&self, domain: ThrottleDomain, key: &str) -> bool {
        self.should_trigger_at(domain, key, self.clock.uptime_ms())
    }

    /// Same as [`should_trigger`](Self::should_trigger) with an explicit
    /// timestamp in milliseconds.
    pub fn should_trigger_at(&self, domain: ThrottleDomain, key: &str, now_ms: i64) -> bool {
        let interval_ms = i64::try_from(self.interval(domain).as_millis()).unwrap_or(i64::MAX);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let slot = (domain, key.to_string());
        let last = entries.get(&slot).copied();
        match last {
            Some(last) if now_ms.saturating_sub(last) < interval_ms => {
                tracing::trace!(?domain, key, "throttled");
                false
            }
            _ => {
                entries.insert(slot, now_ms);
                true
            }
        }
    }

    /// Forget the last trigger so the next event for `key` fires at once.
    pub fn reset(&self, domain: ThrottleDomain, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(domain, key.to_string()));
    }

    /// Forget every key of `domain`.
    pub fn reset_domain(&self, domain: ThrottleDomain) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(d, _), _| *d != domain);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
