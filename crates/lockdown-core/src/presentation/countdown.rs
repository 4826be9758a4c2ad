//! Remaining-time display.

use std::time::Duration;

/// Outcome of one countdown update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountdownTick {
    /// New text to display.
    Display(String),
    /// Nothing to redraw.
    Unchanged,
    /// The lock has no known end.
    NoDeadline,
    /// Reached zero. Yielded once per countdown.
    Expired,
}

/// Countdown that never shows a larger value than it already showed.
#[derive(Debug, Clone, Default)]
pub struct Countdown {
    shown_secs: Option<u64>,
    expired: bool,
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start over, e.g. for a new lock window.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn shown_secs(&self) -> Option<u64> {
        self.shown_secs
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn update(&mut self, remaining: Option<Duration>) -> CountdownTick {
        if self.expired {
            return CountdownTick::Unchanged;
        }
        let Some(remaining) = remaining else {
            return CountdownTick::NoDeadline;
        };
        // Round up so "00:00:00" is only shown at expiry.
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        if secs == 0 {
            self.expired = true;
            self.shown_secs = Some(0);
            return CountdownTick::Expired;
        }
        match self.shown_secs {
            Some(shown) if secs >= shown => CountdownTick::Unchanged,
            _ => {
                self.shown_secs = Some(secs);
                CountdownTick::Display(format_remaining(secs))
            }
        }
    }
}

/// `HH:MM:SS`; hours are not wrapped.
pub fn format_remaining(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
