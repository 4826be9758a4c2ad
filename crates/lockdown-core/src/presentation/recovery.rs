//! Settings-excursion detection during permission recovery.
//!
//! When the controller sends the user to the permission-settings screen,
//! the blocking surface must stay out of the way while that screen is in
//! front. The preferred detector asks the foreground signal; if that
//! itself is denied, the monitor hides for a fixed window instead and then
//! lets the controller show the recovery prompt again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::foreground::ForegroundSignal;

/// What the blocking surface should do during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcursionView {
    /// The settings screen is frontmost: stay hidden.
    SettingsForeground,
    /// The user left the settings screen: show the recovery prompt.
    SettingsAway,
    /// Detector unavailable; inside the timed hide window.
    FallbackHide,
    /// Detector unavailable and the timed hide window has run out.
    FallbackElapsed,
}

impl ExcursionView {
    pub fn hides(self) -> bool {
        matches!(self, ExcursionView::SettingsForeground | ExcursionView::FallbackHide)
    }
}

#[derive(Debug, Default)]
struct Excursion {
    active: bool,
    fallback_until_ms: Option<i64>,
    fallback_spent: bool,
}

pub struct RecoveryMonitor {
    foreground: Arc<ForegroundSignal>,
    settings_packages: HashSet<String>,
    fallback_hide: Duration,
    clock: Arc<dyn Clock>,
    excursion: Mutex<Excursion>,
}

impl RecoveryMonitor {
    pub fn new(
        foreground: Arc<ForegroundSignal>,
        settings_packages: impl IntoIterator<Item = String>,
        fallback_hide: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            foreground,
            settings_packages: settings_packages.into_iter().collect(),
            fallback_hide,
            clock,
            excursion: Mutex::new(Excursion::default()),
        }
    }

    /// The user was just sent to the settings screen.
    pub fn begin(&self) {
        let mut e = self.lock();
        *e = Excursion {
            active: true,
            ..Excursion::default()
        };
    }

    pub fn end(&self) {
        *self.lock() = Excursion::default();
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Evaluate the current excursion. `None` when no excursion is running.
    pub fn poll(&self) -> Option<ExcursionView> {
        let mut e = self.lock();
        if !e.active {
            return None;
        }
        match self.foreground.current() {
            Ok(Some(package)) => {
                e.fallback_until_ms = None;
                if self.settings_packages.contains(&package) {
                    Some(ExcursionView::SettingsForeground)
                } else {
                    Some(ExcursionView::SettingsAway)
                }
            }
            Ok(None) => Some(ExcursionView::SettingsAway),
            Err(err) => {
                if e.fallback_spent {
                    return Some(ExcursionView::FallbackElapsed);
                }
                let now = self.clock.uptime_ms();
                let until = *e.fallback_until_ms.get_or_insert_with(|| {
                    tracing::warn!(error = %err, "excursion detector unavailable, hiding on a timer");
                    let hide_ms = i64::try_from(self.fallback_hide.as_millis()).unwrap_or(i64::MAX);
                    now.saturating_add(hide_ms)
                });
                if now < until {
                    Some(ExcursionView::FallbackHide)
                } else {
                    e.fallback_spent = true;
                    Some(ExcursionView::FallbackElapsed)
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Excursion> {
        self.excursion.lock().unwrap_or_else(|e| e.into_inner())
    }
}
