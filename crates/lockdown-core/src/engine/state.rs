//! Enforcement flags shared by the engine, the redirect burst and the
//! presentation controller.

use std::sync::Mutex;
use std::time::Duration;

/// Progress of a session-exit confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitProgress {
    /// First sighting, or not seen for long enough yet.
    Pending,
    /// The same package stayed frontmost through the confirmation window.
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExitCandidate {
    package: String,
    first_seen_ms: i64,
}

/// Point-in-time copy of [`SharedState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagsSnapshot {
    pub locked: bool,
    pub emergency_flow: bool,
    pub allowed_foreground: bool,
    pub recovery_mode: bool,
    pub recovery_excursion: bool,
    pub exit_candidate: Option<String>,
}

#[derive(Debug, Default)]
struct Flags {
    locked: bool,
    emergency_flow: bool,
    allowed_foreground: bool,
    /// The surface is in permission-recovery mode.
    recovery_mode: bool,
    /// Within recovery mode, the settings screen is frontmost (or the
    /// detector's timed hide window is running).
    recovery_excursion: bool,
    exit_candidate: Option<ExitCandidate>,
}

/// Mutable enforcement flags behind one mutex.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<Flags>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FlagsSnapshot {
        let f = self.lock();
        FlagsSnapshot {
            locked: f.locked,
            emergency_flow: f.emergency_flow,
            allowed_foreground: f.allowed_foreground,
            recovery_mode: f.recovery_mode,
            recovery_excursion: f.recovery_excursion,
            exit_candidate: f.exit_candidate.as_ref().map(|c| c.package.clone()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    /// Cache the lock flag. Unlocking drops every per-lock flag.
    pub fn set_locked(&self, locked: bool) {
        let mut f = self.lock();
        if locked {
            f.locked = true;
        } else {
            *f = Flags::default();
        }
    }

    pub fn is_emergency_flow(&self) -> bool {
        self.lock().emergency_flow
    }

    /// Returns the previous value.
    pub fn set_emergency_flow(&self, active: bool) -> bool {
        std::mem::replace(&mut self.lock().emergency_flow, active)
    }

    pub fn is_allowed_foreground(&self) -> bool {
        self.lock().allowed_foreground
    }

    pub fn set_allowed_foreground(&self, foreground: bool) {
        let mut f = self.lock();
        f.allowed_foreground = foreground;
        if foreground {
            f.exit_candidate = None;
        }
    }

    pub fn is_recovery_excursion(&self) -> bool {
        self.lock().recovery_excursion
    }

    /// Only takes effect in recovery mode.
    pub fn set_recovery_excursion(&self, active: bool) {
        let mut f = self.lock();
        f.recovery_excursion = active && f.recovery_mode;
    }

    pub fn is_recovery_mode(&self) -> bool {
        self.lock().recovery_mode
    }

    /// Leaving recovery mode also ends any excursion.
    pub fn set_recovery_mode(&self, active: bool) {
        let mut f = self.lock();
        f.recovery_mode = active;
        if !active {
            f.recovery_excursion = false;
        }
    }

    /// Feed a non-allowed sighting during a session. The exit is confirmed
    /// once the same package is seen again at least `confirm` after its
    /// first sighting; a different package restarts the window.
    pub fn observe_exit_candidate(&self, package: &str, now_ms: i64, confirm: Duration) -> ExitProgress {
        let confirm_ms = i64::try_from(confirm.as_millis()).unwrap_or(i64::MAX);
        let mut f = self.lock();
        match &f.exit_candidate {
            Some(c) if c.package == package => {
                if now_ms.saturating_sub(c.first_seen_ms) >= confirm_ms {
                    f.exit_candidate = None;
                    ExitProgress::Confirmed
                } else {
                    ExitProgress::Pending
                }
            }
            _ => {
                f.exit_candidate = Some(ExitCandidate {
                    package: package.to_string(),
                    first_seen_ms: now_ms,
                });
                ExitProgress::Pending
            }
        }
    }

    pub fn clear_exit_candidate(&self) {
        self.lock().exit_candidate = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Flags> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
