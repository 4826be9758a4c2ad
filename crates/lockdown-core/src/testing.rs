//! In-memory collaborators for tests and host-less runs.
//!
//! Each double records what it was asked to do so scenarios can assert on
//! the exact host traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use crate::clock::ManualClock;
use crate::error::{ForegroundError, PresentationError, SchedulingError};
use crate::foreground::{ForegroundQuery, UsageEvent};
use crate::presentation::{
    NotificationHost, PermissionProbe, PresentationHost, PresentationHosts, PresentationMode,
};
use crate::scheduler::{AlarmBackend, AlarmId, AlarmKind, PeriodicJobBackend, Precision};
use crate::wakelock::WakeLock;

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Foreground ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Script {
    foreground: Option<String>,
    events: Option<Vec<UsageEvent>>,
    denied: bool,
}

/// Foreground query with a scripted answer.
#[derive(Debug, Default)]
pub struct ScriptedForeground {
    script: Mutex<Script>,
    queries: AtomicUsize,
}

impl ScriptedForeground {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `package` as freshly foregrounded on every query.
    pub fn set_foreground(&self, package: &str) {
        let mut s = guard(&self.script);
        s.foreground = Some(package.to_string());
        s.events = None;
    }

    /// Answer every query with exactly `events`.
    pub fn push_events(&self, events: Vec<UsageEvent>) {
        let mut s = guard(&self.script);
        s.foreground = None;
        s.events = Some(events);
    }

    /// Fail queries with `PermissionDenied`.
    pub fn deny(&self) {
        guard(&self.script).denied = true;
    }

    pub fn allow(&self) {
        guard(&self.script).denied = false;
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

impl ForegroundQuery for ScriptedForeground {
    fn query(&self, _window: Duration) -> Result<Vec<UsageEvent>, ForegroundError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let s = guard(&self.script);
        if s.denied {
            return Err(ForegroundError::PermissionDenied);
        }
        if let Some(events) = &s.events {
            return Ok(events.clone());
        }
        Ok(s
            .foreground
            .iter()
            .map(|p| UsageEvent::new(p.clone(), Utc::now()))
            .collect())
    }
}

// ── Presentation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Show,
    Hide,
    SetSuppressed(bool),
    SetMode(PresentationMode),
    UpdateCountdown(String),
    BringToFront,
    OpenEmergencyUnlock,
    OpenPermissionSettings,
    Notify(String),
    ClearNotification,
}

/// Overlay, notification and permission host in one, recording every
/// accepted call.
#[derive(Debug)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    overlay_permission: AtomicBool,
    rejection: Mutex<Option<String>>,
    notifications_fail: AtomicBool,
    settings_fail: AtomicBool,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            overlay_permission: AtomicBool::new(true),
            rejection: Mutex::new(None),
            notifications_fail: AtomicBool::new(false),
            settings_fail: AtomicBool::new(false),
        }
    }
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hosts(self: &Arc<Self>) -> PresentationHosts {
        PresentationHosts {
            surface: self.clone(),
            notifications: self.clone(),
            permissions: self.clone(),
        }
    }

    pub fn set_overlay_permission(&self, granted: bool) {
        self.overlay_permission.store(granted, Ordering::Relaxed);
    }

    /// Reject every surface call from now on.
    pub fn reject_with(&self, reason: &str) {
        *guard(&self.rejection) = Some(reason.to_string());
    }

    pub fn accept(&self) {
        guard(&self.rejection).take();
    }

    pub fn fail_notifications(&self) {
        self.notifications_fail.store(true, Ordering::Relaxed);
    }

    /// Make `open_permission_settings` fail from now on.
    pub fn fail_permission_settings(&self) {
        self.settings_fail.store(true, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<HostCall> {
        guard(&self.calls).clone()
    }

    pub fn count(&self, call: &HostCall) -> usize {
        guard(&self.calls).iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        guard(&self.calls).clear();
    }

    pub fn last_countdown(&self) -> Option<String> {
        guard(&self.calls).iter().rev().find_map(|c| match c {
            HostCall::UpdateCountdown(text) => Some(text.clone()),
            _ => None,
        })
    }

    fn surface(&self, call: HostCall) -> Result<(), PresentationError> {
        if let Some(reason) = guard(&self.rejection).clone() {
            return Err(PresentationError::HostRejected(reason));
        }
        guard(&self.calls).push(call);
        Ok(())
    }

    fn notification(&self, call: HostCall) -> Result<(), PresentationError> {
        if self.notifications_fail.load(Ordering::Relaxed) {
            return Err(PresentationError::HostRejected("notifications disabled".into()));
        }
        guard(&self.calls).push(call);
        Ok(())
    }
}

impl PresentationHost for RecordingHost {
    fn show(&self) -> Result<(), PresentationError> {
        self.surface(HostCall::Show)
    }

    fn hide(&self) -> Result<(), PresentationError> {
        self.surface(HostCall::Hide)
    }

    fn set_suppressed(&self, suppressed: bool) -> Result<(), PresentationError> {
        self.surface(HostCall::SetSuppressed(suppressed))
    }

    fn set_mode(&self, mode: PresentationMode) -> Result<(), PresentationError> {
        self.surface(HostCall::SetMode(mode))
    }

    fn update_countdown(&self, text: &str) -> Result<(), PresentationError> {
        self.surface(HostCall::UpdateCountdown(text.to_string()))
    }

    fn bring_to_front(&self) -> Result<(), PresentationError> {
        self.surface(HostCall::BringToFront)
    }

    fn open_emergency_unlock(&self) -> Result<(), PresentationError> {
        self.surface(HostCall::OpenEmergencyUnlock)
    }
}

impl NotificationHost for RecordingHost {
    fn update_ongoing(&self, text: &str) -> Result<(), PresentationError> {
        self.notification(HostCall::Notify(text.to_string()))
    }

    fn clear(&self) -> Result<(), PresentationError> {
        self.notification(HostCall::ClearNotification)
    }
}

impl PermissionProbe for RecordingHost {
    fn overlay_permission_granted(&self) -> bool {
        self.overlay_permission.load(Ordering::Relaxed)
    }

    fn open_permission_settings(&self) -> Result<(), PresentationError> {
        if self.settings_fail.load(Ordering::Relaxed) {
            return Err(PresentationError::HostRejected("no settings activity".into()));
        }
        guard(&self.calls).push(HostCall::OpenPermissionSettings);
        Ok(())
    }
}

// ── Wake lock ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CountingWakeLock {
    held: Mutex<HashMap<String, usize>>,
    acquisitions: AtomicUsize,
}

impl CountingWakeLock {
    /// Acquisitions not yet released.
    pub fn held(&self) -> usize {
        guard(&self.held).values().sum()
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self, tag: &str, _timeout: Duration) {
        *guard(&self.held).entry(tag.to_string()).or_insert(0) += 1;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, tag: &str) {
        let mut held = guard(&self.held);
        if let Some(n) = held.get_mut(tag) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                held.remove(tag);
            }
        }
    }
}

// ── Alarms ───────────────────────────────────────────────────────────

/// Alarm and job backend that only records what is armed. Nothing fires
/// on its own; tests deliver fires by hand.
#[derive(Debug, Default)]
pub struct InMemoryAlarms {
    armed: Mutex<HashMap<AlarmId, (DateTime<Utc>, Precision)>>,
    jobs: Mutex<HashMap<String, Duration>>,
    deny_exact: AtomicBool,
    fail_all: AtomicBool,
}

impl InMemoryAlarms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_exact(&self, deny: bool) {
        self.deny_exact.store(deny, Ordering::Relaxed);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::Relaxed);
    }

    pub fn get(&self, kind: AlarmKind, key: &str) -> Option<(DateTime<Utc>, Precision)> {
        guard(&self.armed).get(&AlarmId::new(kind, key)).copied()
    }

    pub fn armed_kinds(&self) -> Vec<AlarmKind> {
        let mut kinds: Vec<_> = guard(&self.armed).keys().map(|id| id.kind).collect();
        kinds.sort_by_key(|k| *k as u8);
        kinds.dedup();
        kinds
    }

    pub fn len(&self) -> usize {
        guard(&self.armed).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_job(&self, job: &str) -> bool {
        guard(&self.jobs).contains_key(job)
    }

    fn check(&self) -> Result<(), SchedulingError> {
        if self.fail_all.load(Ordering::Relaxed) {
            return Err(SchedulingError::Backend("alarm service unavailable".into()));
        }
        Ok(())
    }
}

impl AlarmBackend for InMemoryAlarms {
    fn set_exact(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), SchedulingError> {
        self.check()?;
        if self.deny_exact.load(Ordering::Relaxed) {
            return Err(SchedulingError::ExactDenied);
        }
        guard(&self.armed).insert(id.clone(), (at, Precision::Exact));
        Ok(())
    }

    fn set_inexact(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), SchedulingError> {
        self.check()?;
        guard(&self.armed).insert(id.clone(), (at, Precision::Inexact));
        Ok(())
    }

    fn cancel(&self, id: &AlarmId) -> Result<(), SchedulingError> {
        guard(&self.armed).remove(id);
        Ok(())
    }
}

impl PeriodicJobBackend for InMemoryAlarms {
    fn schedule_periodic(&self, job: &str, period: Duration) -> Result<(), SchedulingError> {
        self.check()?;
        guard(&self.jobs).insert(job.to_string(), period);
        Ok(())
    }

    fn cancel_job(&self, job: &str) -> Result<(), SchedulingError> {
        guard(&self.jobs).remove(job);
        Ok(())
    }
}
