//! Blocking-surface presentation.
//!
//! The [`PresentationController`] owns the surface mode state machine:
//!
//! ```text
//! (inactive) --activate--> Locked <--permission granted / lost--> PermissionRecovery
//!      ^                                                               |
//!      +------------------------- deactivate --------------------------+
//! ```
//!
//! It receives [`PresentationCommand`]s from the enforcement engine and
//! also polls on its own: the countdown every `countdown_tick`, and the
//! recovery excursion every `recovery_poll`.

pub mod countdown;
pub mod recovery;
pub mod suppression;

pub use countdown::{format_remaining, Countdown, CountdownTick};
pub use recovery::{ExcursionView, RecoveryMonitor};
pub use suppression::Suppression;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::engine::SharedState;
use crate::error::PresentationError;
use crate::events::{Event, EventBus, Permission};
use crate::lock_state::LockStore;
use crate::storage::TimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationMode {
    /// Normal enforcing mode.
    Locked,
    /// The always-on-surface permission is missing; the surface shows a
    /// prompt to grant it back.
    PermissionRecovery,
}

/// Commands the engine sends to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationCommand {
    Activate,
    /// Re-show the overlay over whatever is in front. Also re-checks the
    /// permission right away.
    ForceShow,
    /// Raise the blocking screen itself.
    BringToFront,
    OpenEmergencyUnlock,
    /// An allowed app is still in front.
    RefreshSuppression,
    ClearSuppression,
    Deactivate,
}

/// Overlay/presentation host.
pub trait PresentationHost: Send + Sync {
    fn show(&self) -> Result<(), PresentationError>;
    fn hide(&self) -> Result<(), PresentationError>;
    /// Transparent and non-interactive, but still attached.
    fn set_suppressed(&self, suppressed: bool) -> Result<(), PresentationError>;
    fn set_mode(&self, mode: PresentationMode) -> Result<(), PresentationError>;
    fn update_countdown(&self, text: &str) -> Result<(), PresentationError>;
    fn bring_to_front(&self) -> Result<(), PresentationError>;
    fn open_emergency_unlock(&self) -> Result<(), PresentationError>;
}

/// Best-effort ongoing notification. Failures are logged and dropped.
pub trait NotificationHost: Send + Sync {
    fn update_ongoing(&self, text: &str) -> Result<(), PresentationError>;
    fn clear(&self) -> Result<(), PresentationError>;
}

pub trait PermissionProbe: Send + Sync {
    fn overlay_permission_granted(&self) -> bool;
    /// Launch the OS screen where the overlay permission is granted.
    fn open_permission_settings(&self) -> Result<(), PresentationError>;
}

/// The host-side collaborators of the controller.
#[derive(Clone)]
pub struct PresentationHosts {
    pub surface: Arc<dyn PresentationHost>,
    pub notifications: Arc<dyn NotificationHost>,
    pub permissions: Arc<dyn PermissionProbe>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Running,
    /// The countdown reached zero on this tick.
    Expired,
    Detached,
}

struct ControllerState {
    active: bool,
    detached: bool,
    mode: PresentationMode,
    countdown: Countdown,
    suppression: Suppression,
    /// Hidden for a settings excursion.
    hidden: bool,
}

pub struct PresentationController {
    hosts: PresentationHosts,
    store: Arc<LockStore>,
    shared: Arc<SharedState>,
    recovery: RecoveryMonitor,
    events: EventBus,
    clock: Arc<dyn Clock>,
    countdown_tick: Duration,
    recovery_poll: Duration,
    state: Mutex<ControllerState>,
}

impl PresentationController {
    pub fn new(
        hosts: PresentationHosts,
        store: Arc<LockStore>,
        shared: Arc<SharedState>,
        recovery: RecoveryMonitor,
        events: EventBus,
        timing: &TimingConfig,
    ) -> Self {
        let clock = store.clock().clone();
        Self {
            hosts,
            store,
            shared,
            recovery,
            events,
            clock,
            countdown_tick: timing.countdown_tick(),
            recovery_poll: timing.recovery_poll(),
            state: Mutex::new(ControllerState {
                active: false,
                detached: false,
                mode: PresentationMode::Locked,
                countdown: Countdown::new(),
                suppression: Suppression::new(timing.suppression_stale()),
                hidden: false,
            }),
        }
    }

    pub fn mode(&self) -> PresentationMode {
        self.lock().mode
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn is_detached(&self) -> bool {
        self.lock().detached
    }

    pub fn is_suppressed(&self) -> bool {
        self.lock().suppression.is_suppressed()
    }

    /// Attach the blocking surface. The initial mode follows the overlay
    /// permission. A previously detached controller gets one fresh attempt.
    pub fn activate(&self) -> Result<PresentationMode, PresentationError> {
        let mut st = self.lock();
        st.detached = false;
        let was_active = st.active;
        let previous = st.mode;
        let mode = if self.hosts.permissions.overlay_permission_granted() {
            PresentationMode::Locked
        } else {
            PresentationMode::PermissionRecovery
        };

        st.countdown.reset();
        st.suppression.clear();
        self.check(&mut st, self.hosts.surface.set_mode(mode))?;
        self.check(&mut st, self.hosts.surface.show())?;
        st.active = true;
        st.hidden = false;
        st.mode = mode;

        match mode {
            PresentationMode::Locked => {
                self.recovery.end();
                self.shared.set_recovery_mode(false);
            }
            PresentationMode::PermissionRecovery => {
                self.shared.set_recovery_mode(true);
                self.begin_recovery_excursion();
            }
        }
        if !was_active || previous != mode {
            self.emit_mode(mode);
        }
        tracing::info!(?mode, "presentation activated");
        Ok(mode)
    }

    pub fn handle(&self, command: PresentationCommand) -> Result<(), PresentationError> {
        match command {
            PresentationCommand::Activate => return self.activate().map(|_| ()),
            PresentationCommand::Deactivate => {
                self.deactivate();
                return Ok(());
            }
            _ => {}
        }

        let mut st = self.lock();
        if st.detached {
            return Err(PresentationError::Detached);
        }
        if !st.active {
            tracing::debug!(?command, "presentation inactive, command ignored");
            return Ok(());
        }
        let surface = &self.hosts.surface;
        match command {
            PresentationCommand::ForceShow => {
                if st.mode == PresentationMode::PermissionRecovery
                    && self.hosts.permissions.overlay_permission_granted()
                {
                    self.leave_recovery(&mut st)?;
                }
                if st.mode == PresentationMode::PermissionRecovery {
                    // Re-raise the recovery prompt unless the user is in settings.
                    if self.shared.is_recovery_excursion() {
                        return Ok(());
                    }
                    self.check(&mut st, surface.show())?;
                    st.hidden = false;
                    return Ok(());
                }
                if st.suppression.clear() {
                    self.check(&mut st, surface.set_suppressed(false))?;
                }
                self.check(&mut st, surface.show())?;
                st.hidden = false;
                Ok(())
            }
            PresentationCommand::BringToFront => {
                if st.mode == PresentationMode::PermissionRecovery && self.shared.is_recovery_excursion() {
                    return Ok(());
                }
                self.check(&mut st, surface.bring_to_front())
            }
            PresentationCommand::OpenEmergencyUnlock => self.check(&mut st, surface.open_emergency_unlock()),
            PresentationCommand::RefreshSuppression => {
                let now = self.clock.uptime_ms();
                if st.suppression.refresh(now) {
                    tracing::debug!("overlay suppressed for allowed app");
                    self.check(&mut st, surface.set_suppressed(true))?;
                }
                Ok(())
            }
            PresentationCommand::ClearSuppression => {
                if st.suppression.clear() {
                    tracing::debug!("overlay suppression cleared");
                    self.check(&mut st, surface.set_suppressed(false))?;
                }
                Ok(())
            }
            PresentationCommand::Activate | PresentationCommand::Deactivate => Ok(()),
        }
    }

    /// One countdown tick: permission-loss detection, suppression staleness
    /// and the remaining-time display. Clears the lock when it reaches zero.
    pub fn tick(&self) -> TickOutcome {
        let mut st = self.lock();
        if st.detached {
            return TickOutcome::Detached;
        }
        if !st.active {
            return TickOutcome::Idle;
        }

        if st.mode == PresentationMode::Locked && !self.hosts.permissions.overlay_permission_granted() {
            tracing::warn!("overlay permission lost, entering recovery");
            if self.enter_recovery(&mut st).is_err() {
                return TickOutcome::Detached;
            }
        }

        let now = self.clock.now();
        if st.suppression.expire_if_stale(self.clock.uptime_ms()) {
            tracing::debug!("stale overlay suppression lapsed");
            if self.check(&mut st, self.hosts.surface.set_suppressed(false)).is_err() && st.detached {
                return TickOutcome::Detached;
            }
        }

        let lock = match self.store.read() {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!(error = %e, "countdown could not read lock state");
                return TickOutcome::Running;
            }
        };
        if !lock.is_locked() {
            return TickOutcome::Running;
        }

        match st.countdown.update(lock.remaining(now)) {
            CountdownTick::Display(text) => {
                if st.mode == PresentationMode::Locked {
                    if self.check(&mut st, self.hosts.surface.update_countdown(&text)).is_err() && st.detached {
                        return TickOutcome::Detached;
                    }
                }
                if let Err(e) = self.hosts.notifications.update_ongoing(&text) {
                    tracing::debug!(error = %e, "ongoing notification update failed");
                }
                TickOutcome::Running
            }
            CountdownTick::Expired => {
                drop(st);
                match self.store.clear_if_locked() {
                    Ok(true) => {
                        tracing::info!("lock countdown reached zero");
                        self.events.emit(Event::CountdownExpired { at: now });
                    }
                    Ok(false) => {}
                    Err(e) => tracing::error!(error = %e, "failed to clear expired lock"),
                }
                self.deactivate();
                TickOutcome::Expired
            }
            CountdownTick::Unchanged | CountdownTick::NoDeadline => TickOutcome::Running,
        }
    }

    /// One recovery poll: leave recovery once the permission is back, and
    /// keep the surface out of the settings screen's way meanwhile.
    pub fn poll_recovery(&self) -> Result<(), PresentationError> {
        let mut st = self.lock();
        if !st.active || st.detached || st.mode != PresentationMode::PermissionRecovery {
            return Ok(());
        }
        if self.hosts.permissions.overlay_permission_granted() {
            return self.leave_recovery(&mut st);
        }
        let Some(view) = self.recovery.poll() else {
            self.shared.set_recovery_excursion(false);
            return Ok(());
        };
        self.shared.set_recovery_excursion(view.hides());
        if view.hides() && !st.hidden {
            tracing::debug!(?view, "hiding for settings excursion");
            self.check(&mut st, self.hosts.surface.hide())?;
            st.hidden = true;
        } else if !view.hides() && st.hidden {
            tracing::debug!(?view, "showing recovery prompt again");
            self.check(&mut st, self.hosts.surface.show())?;
            st.hidden = false;
        }
        Ok(())
    }

    /// The user asked to grant the permission from the recovery prompt.
    pub fn open_permission_settings(&self) -> Result<(), PresentationError> {
        let st = self.lock();
        if st.active && st.mode == PresentationMode::PermissionRecovery {
            self.begin_recovery_excursion();
        }
        Ok(())
    }

    /// Detach the surface and clear the notification. Returns whether the
    /// controller was active.
    pub fn deactivate(&self) -> bool {
        let mut st = self.lock();
        let was_active = std::mem::replace(&mut st.active, false);
        let was_suppressed = st.suppression.clear();
        st.countdown.reset();
        st.hidden = false;
        self.recovery.end();
        self.shared.set_recovery_mode(false);
        if !was_active {
            return false;
        }
        if !st.detached {
            if was_suppressed {
                if let Err(e) = self.hosts.surface.set_suppressed(false) {
                    tracing::debug!(error = %e, "failed to clear suppression on teardown");
                }
            }
            if let Err(e) = self.hosts.surface.hide() {
                tracing::warn!(error = %e, "failed to hide blocking surface");
            }
        }
        if let Err(e) = self.hosts.notifications.clear() {
            tracing::debug!(error = %e, "failed to clear ongoing notification");
        }
        tracing::info!("presentation deactivated");
        true
    }

    /// Drive the controller until `cancel` fires, the command channel
    /// closes, the countdown expires or the host detaches.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<PresentationCommand>, cancel: CancellationToken) {
        let mut countdown = tokio::time::interval(self.countdown_tick);
        countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut recovery = tokio::time::interval(self.recovery_poll);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.handle(command) {
                            tracing::debug!(?command, error = %e, "presentation command failed");
                        }
                    }
                    None => break,
                },
                _ = countdown.tick() => {
                    if self.tick() == TickOutcome::Expired {
                        break;
                    }
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.poll_recovery() {
                        tracing::debug!(error = %e, "recovery poll failed");
                    }
                }
            }
            if self.is_detached() {
                tracing::warn!("presentation host detached, controller stopping");
                break;
            }
        }
        tracing::debug!("presentation loop stopped");
    }

    // ── Mode transitions ─────────────────────────────────────────────

    fn enter_recovery(&self, st: &mut ControllerState) -> Result<(), PresentationError> {
        self.check(st, self.hosts.surface.set_mode(PresentationMode::PermissionRecovery))?;
        st.mode = PresentationMode::PermissionRecovery;
        self.shared.set_recovery_mode(true);
        self.emit_mode(st.mode);
        self.begin_recovery_excursion();
        Ok(())
    }

    fn leave_recovery(&self, st: &mut ControllerState) -> Result<(), PresentationError> {
        self.recovery.end();
        self.shared.set_recovery_mode(false);
        self.check(st, self.hosts.surface.set_mode(PresentationMode::Locked))?;
        st.mode = PresentationMode::Locked;
        if st.hidden {
            self.check(st, self.hosts.surface.show())?;
            st.hidden = false;
        }
        tracing::info!("overlay permission granted, back to locked mode");
        self.emit_mode(st.mode);
        Ok(())
    }

    /// Send the user to the permission screen. The excursion flag itself is
    /// driven by [`poll_recovery`](Self::poll_recovery).
    fn begin_recovery_excursion(&self) {
        self.events.emit(Event::PermissionDenied {
            permission: Permission::Overlay,
            at: self.clock.now(),
        });
        match self.hosts.permissions.open_permission_settings() {
            Ok(()) => self.recovery.begin(),
            Err(e) => tracing::warn!(error = %e, "could not open permission settings"),
        }
    }

    fn emit_mode(&self, mode: PresentationMode) {
        self.events.emit(Event::ModeChanged {
            mode,
            at: self.clock.now(),
        });
    }

    /// Mark the controller detached when the host rejects the surface.
    fn check(&self, st: &mut ControllerState, result: Result<(), PresentationError>) -> Result<(), PresentationError> {
        if let Err(PresentationError::HostRejected(reason)) = &result {
            tracing::warn!(reason = %reason, "presentation host rejected the surface");
            st.detached = true;
            st.active = false;
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::foreground::ForegroundSignal;
    use crate::storage::{LockConfig, SqliteKv, Tier};
    use crate::testing::{HostCall, RecordingHost, ScriptedForeground};

    struct Fixture {
        clock: Arc<ManualClock>,
        host: Arc<RecordingHost>,
        foreground: Arc<ScriptedForeground>,
        store: Arc<LockStore>,
        shared: Arc<SharedState>,
        events: EventBus,
        controller: PresentationController,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let host = Arc::new(RecordingHost::new());
        let foreground = Arc::new(ScriptedForeground::new());
        let timing = TimingConfig::default();
        let store = Arc::new(LockStore::new(
            Arc::new(SqliteKv::open_memory(Tier::Protected).unwrap()),
            Arc::new(SqliteKv::open_memory(Tier::Credential).unwrap()),
            clock.clone(),
            LockConfig::default(),
        ));
        let shared = Arc::new(SharedState::new());
        let events = EventBus::new();
        let signal = Arc::new(ForegroundSignal::new(foreground.clone(), &timing));
        let recovery = RecoveryMonitor::new(
            signal,
            vec!["com.android.settings".to_string()],
            timing.recovery_fallback_hide(),
            clock.clone(),
        );
        let controller = PresentationController::new(
            host.hosts(),
            store.clone(),
            shared.clone(),
            recovery,
            events.clone(),
            &timing,
        );
        Fixture {
            clock,
            host,
            foreground,
            store,
            shared,
            events,
            controller,
        }
    }

    #[test]
    fn activation_mode_follows_permission() {
        let f = fixture();
        assert_eq!(f.controller.activate().unwrap(), PresentationMode::Locked);

        let f = fixture();
        f.host.set_overlay_permission(false);
        assert_eq!(f.controller.activate().unwrap(), PresentationMode::PermissionRecovery);
        assert!(f.shared.is_recovery_mode());
        assert!(!f.shared.is_recovery_excursion());
        assert!(f.host.calls().contains(&HostCall::OpenPermissionSettings));
    }

    #[test]
    fn recovery_prompt_is_raised_again_outside_settings() {
        let f = fixture();
        f.host.set_overlay_permission(false);
        f.controller.activate().unwrap();
        f.foreground.set_foreground("com.example.game");
        f.controller.poll_recovery().unwrap();
        assert!(!f.shared.is_recovery_excursion());

        let shows = f.host.count(&HostCall::Show);
        f.controller.handle(PresentationCommand::ForceShow).unwrap();
        f.controller.handle(PresentationCommand::BringToFront).unwrap();
        assert_eq!(f.host.count(&HostCall::Show), shows + 1);
        assert_eq!(f.host.count(&HostCall::BringToFront), 1);

        // In the settings screen the prompt stays out of the way.
        f.foreground.set_foreground("com.android.settings");
        f.controller.poll_recovery().unwrap();
        assert!(f.shared.is_recovery_excursion());
        f.controller.handle(PresentationCommand::ForceShow).unwrap();
        f.controller.handle(PresentationCommand::BringToFront).unwrap();
        assert_eq!(f.host.calls().last(), Some(&HostCall::Hide));

        f.foreground.set_foreground("com.example.game");
        f.controller.poll_recovery().unwrap();
        assert!(!f.shared.is_recovery_excursion());
        assert_eq!(f.host.calls().last(), Some(&HostCall::Show));
    }

    #[test]
    fn failed_settings_launch_starts_no_excursion() {
        let f = fixture();
        f.host.fail_permission_settings();
        f.host.set_overlay_permission(false);
        f.controller.activate().unwrap();
        f.foreground.set_foreground("com.example.game");
        f.controller.poll_recovery().unwrap();
        assert!(f.shared.is_recovery_mode());
        assert!(!f.shared.is_recovery_excursion());
        assert!(!f.host.calls().contains(&HostCall::OpenPermissionSettings));
    }

    #[test]
    fn countdown_updates_then_expires_once() {
        let f = fixture();
        f.store.start_lock(Duration::from_secs(120)).unwrap();
        f.controller.activate().unwrap();
        let mut events = f.events.subscribe();

        assert_eq!(f.controller.tick(), TickOutcome::Running);
        assert_eq!(f.host.last_countdown().as_deref(), Some("00:02:00"));

        f.clock.advance(Duration::from_secs(120));
        assert_eq!(f.controller.tick(), TickOutcome::Expired);
        assert!(!f.store.read().unwrap().is_locked());
        assert!(!f.controller.is_active());
        assert_eq!(f.controller.tick(), TickOutcome::Idle);

        let mut expirations = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::CountdownExpired { .. }) {
                expirations += 1;
            }
        }
        assert_eq!(expirations, 1);
    }

    #[test]
    fn suppression_is_refreshed_and_lapses() {
        let f = fixture();
        f.controller.activate().unwrap();
        f.controller.handle(PresentationCommand::RefreshSuppression).unwrap();
        f.controller.handle(PresentationCommand::RefreshSuppression).unwrap();
        assert!(f.controller.is_suppressed());
        assert_eq!(f.host.count(&HostCall::SetSuppressed(true)), 1);

        f.clock.advance(Duration::from_secs(5));
        f.controller.tick();
        assert!(!f.controller.is_suppressed());
        assert_eq!(f.host.count(&HostCall::SetSuppressed(false)), 1);
    }

    #[test]
    fn suppression_lapses_across_a_wall_clock_step() {
        let f = fixture();
        f.controller.activate().unwrap();
        f.controller.handle(PresentationCommand::RefreshSuppression).unwrap();
        f.clock.adjust_wall(chrono::Duration::minutes(-10));
        f.clock.advance(Duration::from_secs(5));
        f.controller.tick();
        assert!(!f.controller.is_suppressed());
    }

    #[test]
    fn force_show_clears_suppression() {
        let f = fixture();
        f.controller.activate().unwrap();
        f.controller.handle(PresentationCommand::RefreshSuppression).unwrap();
        f.controller.handle(PresentationCommand::ForceShow).unwrap();
        assert!(!f.controller.is_suppressed());
        assert_eq!(f.host.count(&HostCall::Show), 2);
    }

    #[test]
    fn permission_loss_and_recovery() {
        let f = fixture();
        f.controller.activate().unwrap();
        f.host.set_overlay_permission(false);
        f.controller.tick();
        assert_eq!(f.controller.mode(), PresentationMode::PermissionRecovery);

        f.foreground.set_foreground("com.android.settings");
        f.controller.poll_recovery().unwrap();
        assert!(f.host.calls().contains(&HostCall::Hide));
        assert!(f.shared.is_recovery_excursion());

        f.host.set_overlay_permission(true);
        f.controller.poll_recovery().unwrap();
        assert_eq!(f.controller.mode(), PresentationMode::Locked);
        assert!(!f.shared.is_recovery_excursion());
        assert_eq!(f.host.calls().last(), Some(&HostCall::Show));
    }

    #[test]
    fn force_show_leaves_recovery_when_granted() {
        let f = fixture();
        f.host.set_overlay_permission(false);
        f.controller.activate().unwrap();
        f.host.set_overlay_permission(true);
        f.controller.handle(PresentationCommand::ForceShow).unwrap();
        assert_eq!(f.controller.mode(), PresentationMode::Locked);
    }

    #[test]
    fn host_rejection_detaches() {
        let f = fixture();
        f.host.reject_with("no overlay grant");
        assert!(matches!(f.controller.activate(), Err(PresentationError::HostRejected(_))));
        assert!(f.controller.is_detached());
        assert_eq!(f.controller.tick(), TickOutcome::Detached);
        assert_eq!(
            f.controller.handle(PresentationCommand::ForceShow),
            Err(PresentationError::Detached)
        );
    }

    #[test]
    fn notification_failures_are_swallowed() {
        let f = fixture();
        f.host.fail_notifications();
        f.store.start_lock(Duration::from_secs(120)).unwrap();
        f.controller.activate().unwrap();
        assert_eq!(f.controller.tick(), TickOutcome::Running);
        assert!(f.host.last_countdown().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let f = fixture();
        let controller = Arc::new(f.controller);
        controller.activate().unwrap();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(controller.clone().run(rx, cancel.clone()));
        tx.send(PresentationCommand::BringToFront).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.host.calls().contains(&HostCall::BringToFront));
        cancel.cancel();
        task.await.unwrap();
    }
}
