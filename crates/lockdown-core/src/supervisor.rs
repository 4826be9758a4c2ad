//! Lock supervisor.
//!
//! Owns every enforcement component and the root cancellation token. While a
//! lock is active it runs three tasks under one child token:
//!
//! - the foreground polling stream,
//! - the enforcement engine loop,
//! - the presentation controller loop.
//!
//! Activation is idempotent: re-entering it while those tasks are healthy
//! only re-asserts the surface. Deactivation cancels the child token, tears
//! the surface down, clears the session store and cancels the enforcement
//! alarms.
//!
//! Restart policy: the host forwards OS lifecycle callbacks
//! ([`LifecycleSignal`]) and alarm fires ([`AlarmFire`]); each one re-reads
//! the durable lock state and converges on it. Nothing relies on the host
//! restarting a sticky service.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::engine::{EngineDeps, EnforcementEngine, SharedState};
use crate::error::Result;
use crate::events::{DeactivationReason, Event, EventBus};
use crate::foreground::{ForegroundQuery, ForegroundSignal};
use crate::lock_state::{LockState, LockStateChange, LockStore, ReconcileOutcome};
use crate::presentation::{
    PresentationCommand, PresentationController, PresentationHosts, PresentationMode, RecoveryMonitor,
};
use crate::scheduler::{AlarmBackend, AlarmFire, AlarmKind, PeriodicJobBackend, ResilienceScheduler};
use crate::session::SessionStore;
use crate::storage::{EngineConfig, KeyValueStore};
use crate::throttle::{ThrottleIntervals, ThrottleLedger};
use crate::wakelock::{WakeLock, WakeLockGuard};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Logical target relaunched after the task is swiped away.
pub const ENFORCEMENT_RESTART_TARGET: &str = "enforcement";

/// OS lifecycle callbacks the host forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    BootCompleted,
    /// Boot finished but the credential tier is still locked.
    LockedBootCompleted,
    UserUnlocked,
    PackageReplaced,
    TaskRemoved,
}

/// Host-provided collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Readable right after boot.
    pub protected: Arc<dyn KeyValueStore>,
    /// Readable only after the user unlocks the device.
    pub credential: Arc<dyn KeyValueStore>,
    pub foreground: Arc<dyn ForegroundQuery>,
    pub hosts: PresentationHosts,
    pub alarms: Arc<dyn AlarmBackend>,
    pub jobs: Arc<dyn PeriodicJobBackend>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub clock: Arc<dyn Clock>,
}

/// Snapshot for the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub locked: bool,
    pub end: Option<DateTime<Utc>>,
    pub remaining_secs: Option<u64>,
    /// `None` while the surface is not attached.
    pub mode: Option<PresentationMode>,
    pub suppressed: bool,
    pub session_active: bool,
    /// Enforcement tasks are running.
    pub enforcing: bool,
    /// The presentation host rejected the surface.
    pub detached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Started,
    AlreadyActive,
}

struct Enforcement {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    end: Option<DateTime<Utc>>,
}

impl Enforcement {
    fn is_healthy(&self) -> bool {
        !self.cancel.is_cancelled() && self.tasks.iter().all(|t| !t.is_finished())
    }
}

pub struct LockSupervisor {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<LockStore>,
    sessions: Arc<SessionStore>,
    shared: Arc<SharedState>,
    foreground: Arc<ForegroundSignal>,
    engine: Arc<EnforcementEngine>,
    presentation: Arc<PresentationController>,
    scheduler: ResilienceScheduler,
    wake_lock: Arc<dyn WakeLock>,
    events: EventBus,
    root: CancellationToken,
    enforcement: Mutex<Option<Enforcement>>,
}

impl LockSupervisor {
    /// Wire all components together.
    ///
    /// # Errors
    /// Returns a configuration error when `config` fails validation.
    pub fn new(config: EngineConfig, c: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        let events = EventBus::new();
        let store = Arc::new(LockStore::new(
            c.protected.clone(),
            c.credential,
            c.clock.clone(),
            config.lock.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(
            c.protected,
            c.clock.clone(),
            config.schedule.boot_epoch_tolerance(),
        ));
        let throttle = Arc::new(ThrottleLedger::new(
            ThrottleIntervals::from_config(&config),
            c.clock.clone(),
        ));
        let shared = Arc::new(SharedState::new());
        let foreground = Arc::new(ForegroundSignal::new(c.foreground, &config.timing));

        let engine = Arc::new(EnforcementEngine::new(
            &config,
            EngineDeps {
                store: store.clone(),
                sessions: sessions.clone(),
                throttle: throttle.clone(),
                shared: shared.clone(),
                wake_lock: c.wake_lock.clone(),
                events: events.clone(),
            },
        ));
        let recovery = RecoveryMonitor::new(
            foreground.clone(),
            config.packages.permission_settings_packages.clone(),
            config.timing.recovery_fallback_hide(),
            c.clock.clone(),
        );
        let presentation = Arc::new(PresentationController::new(
            c.hosts,
            store.clone(),
            shared.clone(),
            recovery,
            events.clone(),
            &config.timing,
        ));
        let scheduler = ResilienceScheduler::new(
            c.alarms,
            c.jobs,
            throttle,
            c.clock.clone(),
            config.schedule.clone(),
            events.clone(),
        );

        Ok(Arc::new(Self {
            config,
            clock: c.clock,
            store,
            sessions,
            shared,
            foreground,
            engine,
            presentation,
            scheduler,
            wake_lock: c.wake_lock,
            events,
            root: CancellationToken::new(),
            enforcement: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LockStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn engine(&self) -> &Arc<EnforcementEngine> {
        &self.engine
    }

    pub fn presentation(&self) -> &Arc<PresentationController> {
        &self.presentation
    }

    pub fn scheduler(&self) -> &ResilienceScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn is_enforcing(&self) -> bool {
        self.slot().as_ref().is_some_and(Enforcement::is_healthy)
    }

    pub fn status(&self) -> LockStatus {
        let now = self.clock.now();
        let state = self.store.read().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "status could not read lock state");
            LockState::unlocked()
        });
        let active = self.presentation.is_active();
        LockStatus {
            locked: state.is_locked(),
            end: state.end(),
            remaining_secs: state.remaining(now).map(|d| d.as_secs()),
            mode: active.then(|| self.presentation.mode()),
            suppressed: self.presentation.is_suppressed(),
            session_active: self.sessions.is_session_active(),
            enforcing: self.is_enforcing(),
            detached: self.presentation.is_detached(),
        }
    }

    // ── Lock control ─────────────────────────────────────────────────

    /// Begin a lock of `duration` and start enforcing it.
    pub async fn start_lock(&self, duration: std::time::Duration) -> Result<LockStatus> {
        let change = self.store.start_lock(duration)?;
        tracing::info!(secs = duration.as_secs(), end = ?change.state.end(), "lock started");
        // Armed first so a rejected surface is retried by the heartbeat.
        self.arm_enforcement_alarms(&change.state);
        self.activate(&change.state)?;
        Ok(self.status())
    }

    /// End the lock early.
    pub async fn stop_lock(&self) -> Result<bool> {
        let cleared = self.store.clear_if_locked()?;
        self.deactivate(DeactivationReason::Stopped);
        Ok(cleared)
    }

    pub async fn begin_emergency_unlock(&self) {
        self.engine.begin_emergency_flow().await;
    }

    /// The user backed out of the emergency-unlock surface.
    pub async fn cancel_emergency_unlock(&self) {
        self.engine.end_emergency_flow();
        if let Err(e) = self.presentation.handle(PresentationCommand::ForceShow) {
            tracing::debug!(error = %e, "could not re-show after emergency cancel");
        }
    }

    /// The emergency-unlock challenge succeeded: clear everything.
    pub async fn emergency_unlock_succeeded(&self) -> Result<bool> {
        self.engine.end_emergency_flow();
        let cleared = self.store.clear_if_locked()?;
        self.deactivate(DeactivationReason::EmergencyUnlock);
        tracing::info!(cleared, "emergency unlock completed");
        Ok(cleared)
    }

    /// The user picked an allow-list shortcut for `package`.
    pub async fn launch_allowed_app(&self, package: &str) -> Result<()> {
        self.engine.begin_allowed_launch(package)?;
        if let Err(e) = self.presentation.handle(PresentationCommand::RefreshSuppression) {
            tracing::debug!(error = %e, "could not suppress for launch");
        }
        Ok(())
    }

    /// The user asked to grant the overlay permission from the prompt.
    pub fn open_permission_settings(&self) -> Result<()> {
        self.presentation.open_permission_settings()?;
        Ok(())
    }

    // ── Activation ───────────────────────────────────────────────────

    /// Start the enforcement tasks for `state` unless they already run.
    ///
    /// # Errors
    /// Fails when the presentation host rejects the surface; nothing is
    /// left running in that case.
    pub fn activate(&self, state: &LockState) -> Result<Activation> {
        let mut slot = self.slot();
        self.engine.on_lock_state(state);
        if let Some(current) = slot.as_mut() {
            if current.is_healthy() && !self.presentation.is_detached() {
                current.end = state.end();
                return Ok(Activation::AlreadyActive);
            }
            tracing::warn!("enforcement tasks found stopped, restarting");
            current.cancel.cancel();
            *slot = None;
        }

        let cancel = self.root.child_token();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        self.engine.connect(commands_tx, cancel.clone());
        if let Err(e) = self.presentation.activate() {
            tracing::warn!(error = %e, "blocking surface could not be attached");
            self.engine.disconnect();
            cancel.cancel();
            return Err(e.into());
        }

        let (samples, stream) = self.foreground.spawn_stream(cancel.clone());
        let engine = tokio::spawn(
            self.engine
                .clone()
                .run(samples, self.store.subscribe(), cancel.clone()),
        );
        let presentation = tokio::spawn(self.presentation.clone().run(commands_rx, cancel.clone()));
        *slot = Some(Enforcement {
            cancel,
            tasks: vec![stream, engine, presentation],
            end: state.end(),
        });
        drop(slot);

        tracing::info!(end = ?state.end(), "enforcement activated");
        self.events.emit(Event::LockActivated {
            end: state.end(),
            at: self.clock.now(),
        });
        Ok(Activation::Started)
    }

    /// Stop enforcement. Returns whether it was running.
    pub fn deactivate(&self, reason: DeactivationReason) -> bool {
        let running = self.slot().take();
        if let Some(enforcement) = &running {
            enforcement.cancel.cancel();
        }
        self.engine.disconnect();
        self.engine.end_emergency_flow();
        self.presentation.deactivate();
        self.scheduler.cancel_enforcement_alarms();
        if let Err(e) = self.sessions.clear() {
            tracing::warn!(error = %e, "failed to clear allowed session");
        }
        self.engine.on_lock_state(&LockState::unlocked());

        if running.is_none() {
            return false;
        }
        tracing::info!(?reason, "enforcement deactivated");
        self.events.emit(Event::LockDeactivated {
            reason,
            at: self.clock.now(),
        });
        true
    }

    fn arm_enforcement_alarms(&self, state: &LockState) {
        if let Err(e) = self.scheduler.arm_heartbeat() {
            tracing::warn!(error = %e, "heartbeat not armed");
        }
        if let Some(end) = state.end() {
            if let Err(e) = self.scheduler.arm_lock_expiry(end) {
                tracing::warn!(error = %e, "lock expiry not armed");
            }
        }
    }

    // ── Signals ──────────────────────────────────────────────────────

    /// Converge on the stored state after an OS lifecycle callback.
    pub async fn on_lifecycle(&self, signal: LifecycleSignal) -> Result<()> {
        let _wake = WakeLockGuard::acquire(
            self.wake_lock.clone(),
            "lifecycle",
            self.config.timing.wake_lock_max(),
        );
        tracing::info!(?signal, "lifecycle signal");

        if signal == LifecycleSignal::TaskRemoved {
            if self.shared.is_locked() || self.store.read()?.is_locked() {
                self.scheduler.arm_process_restart(ENFORCEMENT_RESTART_TARGET)?;
            }
            return Ok(());
        }

        // Fast path: the protected tier alone is enough to start enforcing.
        let now = self.clock.now();
        match self.store.read_protected() {
            Ok(state) if state.is_locked() && !state.is_expired(now) => {
                if let Err(e) = self.activate(&state) {
                    tracing::warn!(error = %e, "fast-path activation failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "protected tier unreadable on boot"),
        }

        if signal == LifecycleSignal::LockedBootCompleted || !self.store.credential_reachable() {
            if let Err(e) = self.scheduler.cancel_fallback_job() {
                tracing::warn!(error = %e, "fallback job not cancelled");
            }
        } else {
            match self.store.reconcile_unlocked_from_protected() {
                Ok(ReconcileOutcome::Copied) => tracing::info!("credential tier caught up"),
                Ok(outcome) => tracing::debug!(?outcome, "reconciliation"),
                Err(e) => tracing::warn!(error = %e, "reconciliation failed"),
            }
            if let Err(e) = self.scheduler.arm_fallback_job() {
                tracing::warn!(error = %e, "fallback job not armed");
            }
        }

        let state = self.store.read()?;
        if !state.is_locked() {
            self.deactivate(DeactivationReason::StateCleared);
            return Ok(());
        }
        if state.is_expired(self.clock.now()) {
            self.expire()?;
            return Ok(());
        }
        self.arm_enforcement_alarms(&state);
        match self.scheduler.arm_boot_retries() {
            Ok(n) => tracing::debug!(armed = n, "boot retries armed"),
            Err(e) => tracing::warn!(error = %e, "boot retries not armed"),
        }
        self.activate(&state)?;
        Ok(())
    }

    /// Handle a resilience alarm.
    pub async fn on_alarm(&self, fire: AlarmFire) -> Result<()> {
        let _wake = WakeLockGuard::acquire(
            self.wake_lock.clone(),
            "alarm",
            self.config.timing.wake_lock_max(),
        );
        tracing::debug!(alarm = %fire.id, "alarm fired");
        match fire.id.kind {
            AlarmKind::LockExpiry => self.on_expiry_alarm(),
            kind => self.revalidate(kind).map(|_| ()),
        }
    }

    /// Re-check the stored state and re-assert enforcement if still locked.
    /// Returns whether the lock is still active.
    fn revalidate(&self, kind: AlarmKind) -> Result<bool> {
        let state = self.store.read()?;
        if !state.is_locked() {
            self.deactivate(DeactivationReason::StateCleared);
            return Ok(false);
        }
        if state.is_expired(self.clock.now()) {
            self.expire()?;
            return Ok(false);
        }
        self.arm_enforcement_alarms(&state);
        if self.activate(&state)? == Activation::AlreadyActive {
            if let Err(e) = self.presentation.handle(PresentationCommand::ForceShow) {
                tracing::debug!(error = %e, "re-assert failed");
            }
        }
        tracing::debug!(?kind, "lock revalidated");
        Ok(true)
    }

    fn on_expiry_alarm(&self) -> Result<()> {
        let state = self.store.read()?;
        match state.end() {
            Some(end) if state.is_locked() && !state.is_expired(self.clock.now()) => {
                tracing::debug!(%end, "expiry alarm fired early, re-arming");
                self.scheduler.arm_lock_expiry(end)?;
                Ok(())
            }
            _ if state.is_locked() => self.expire(),
            _ => {
                self.deactivate(self.clear_reason());
                Ok(())
            }
        }
    }

    fn expire(&self) -> Result<()> {
        if self.store.clear_if_locked()? {
            tracing::info!("lock window ended");
        }
        self.deactivate(DeactivationReason::Expired);
        Ok(())
    }

    fn on_state_change(&self, state: &LockState) {
        if state.is_locked() && !state.is_expired(self.clock.now()) {
            match self.activate(state) {
                Ok(Activation::Started) => self.arm_enforcement_alarms(state),
                Ok(Activation::AlreadyActive) => {}
                Err(e) => tracing::warn!(error = %e, "activation on state change failed"),
            }
            return;
        }
        self.deactivate(self.clear_reason());
    }

    /// Why the stored lock disappeared under running enforcement.
    fn clear_reason(&self) -> DeactivationReason {
        let now = self.clock.now();
        let ended = self
            .slot()
            .as_ref()
            .and_then(|e| e.end)
            .is_some_and(|end| end <= now);
        if ended {
            DeactivationReason::Expired
        } else {
            DeactivationReason::StateCleared
        }
    }

    /// Drive the supervisor until [`shutdown`](Self::shutdown) or until
    /// both input channels close.
    pub async fn run(
        self: Arc<Self>,
        mut lifecycle: mpsc::Receiver<LifecycleSignal>,
        mut alarms: mpsc::Receiver<AlarmFire>,
    ) {
        let mut changes = self.store.subscribe();
        let (mut lifecycle_open, mut alarms_open) = (true, true);
        while lifecycle_open || alarms_open {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(LockStateChange { state, .. }) => self.on_state_change(&state),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "supervisor lagged on lock state, re-reading");
                        match self.store.read() {
                            Ok(state) => self.on_state_change(&state),
                            Err(e) => tracing::error!(error = %e, "lock state unknown"),
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                signal = lifecycle.recv(), if lifecycle_open => match signal {
                    Some(signal) => {
                        if let Err(e) = self.on_lifecycle(signal).await {
                            tracing::error!(?signal, error = %e, "lifecycle handling failed");
                        }
                    }
                    None => lifecycle_open = false,
                },
                fire = alarms.recv(), if alarms_open => match fire {
                    Some(fire) => {
                        let id = fire.id.clone();
                        if let Err(e) = self.on_alarm(fire).await {
                            tracing::error!(alarm = %id, error = %e, "alarm handling failed");
                        }
                    }
                    None => alarms_open = false,
                },
            }
        }
        tracing::debug!("supervisor loop stopped");
    }

    /// Stop every task without touching the stored lock or the alarms, as
    /// when the process is going away.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.engine.disconnect();
        tracing::info!("supervisor shut down");
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Enforcement>> {
        self.enforcement.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for LockSupervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::storage::{SqliteKv, Tier};
    use chrono::TimeZone;
    use crate::testing::{CountingWakeLock, HostCall, InMemoryAlarms, RecordingHost, ScriptedForeground};
    use crate::scheduler::{AlarmId, HEARTBEAT_KEY, LOCK_EXPIRY_KEY};
    use std::time::Duration;

    struct Fixture {
        supervisor: Arc<LockSupervisor>,
        host: Arc<RecordingHost>,
        alarms: Arc<InMemoryAlarms>,
        wake_lock: Arc<CountingWakeLock>,
        clock: Arc<TokioClock>,
    }

    fn fixture() -> Fixture {
        let wall = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = Arc::new(TokioClock::anchored_at(wall, Duration::from_secs(3600)));
        let host = Arc::new(RecordingHost::new());
        let alarms = Arc::new(InMemoryAlarms::new());
        let foreground = Arc::new(ScriptedForeground::new());
        foreground.set_foreground("app.lockdown");
        let wake_lock = Arc::new(CountingWakeLock::default());
        let supervisor = LockSupervisor::new(
            EngineConfig::default(),
            Collaborators {
                protected: Arc::new(SqliteKv::open_memory(Tier::Protected).unwrap()),
                credential: Arc::new(SqliteKv::open_memory(Tier::Credential).unwrap()),
                foreground,
                hosts: host.hosts(),
                alarms: alarms.clone(),
                jobs: alarms.clone(),
                wake_lock: wake_lock.clone(),
                clock: clock.clone(),
            },
        )
        .unwrap();
        Fixture {
            supervisor,
            host,
            alarms,
            wake_lock,
            clock,
        }
    }

    fn fire(f: &Fixture, kind: AlarmKind, key: &str) -> AlarmFire {
        AlarmFire {
            id: AlarmId::new(kind, key),
            at: f.clock.now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_lock_activates_and_arms() {
        let f = fixture();
        let status = f.supervisor.start_lock(Duration::from_secs(3600)).await.unwrap();
        assert!(status.locked);
        assert!(status.enforcing);
        assert_eq!(status.mode, Some(PresentationMode::Locked));
        assert_eq!(status.remaining_secs, Some(3600));
        assert!(f.alarms.get(AlarmKind::Heartbeat, HEARTBEAT_KEY).is_some());
        assert!(f.alarms.get(AlarmKind::LockExpiry, LOCK_EXPIRY_KEY).is_some());
        assert!(f.host.calls().contains(&HostCall::Show));
        f.supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn activation_is_idempotent() {
        let f = fixture();
        f.supervisor.start_lock(Duration::from_secs(3600)).await.unwrap();
        let mut events = f.supervisor.subscribe();
        let state = f.supervisor.store().read().unwrap();
        assert_eq!(f.supervisor.activate(&state).unwrap(), Activation::AlreadyActive);
        assert!(events.try_recv().is_err());
        f.supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lock_tears_everything_down() {
        let f = fixture();
        f.supervisor.start_lock(Duration::from_secs(3600)).await.unwrap();
        let mut events = f.supervisor.subscribe();
        assert!(f.supervisor.stop_lock().await.unwrap());

        let status = f.supervisor.status();
        assert!(!status.locked);
        assert!(!status.enforcing);
        assert_eq!(status.mode, None);
        assert!(f.alarms.is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(Event::LockDeactivated { reason: DeactivationReason::Stopped, .. })
        ));
        assert!(!f.supervisor.stop_lock().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reasserts_and_rearms() {
        let f = fixture();
        f.supervisor.start_lock(Duration::from_secs(3600)).await.unwrap();
        let shows = f.host.count(&HostCall::Show);
        f.supervisor.on_alarm(fire(&f, AlarmKind::Heartbeat, HEARTBEAT_KEY)).await.unwrap();
        assert_eq!(f.host.count(&HostCall::Show), shows + 1);
        assert!(f.alarms.get(AlarmKind::Heartbeat, HEARTBEAT_KEY).is_some());
        assert_eq!(f.wake_lock.held(), 0);
        f.supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn early_expiry_alarm_is_rearmed() {
        let f = fixture();
        f.supervisor.start_lock(Duration::from_secs(3600)).await.unwrap();
        f.supervisor.on_alarm(fire(&f, AlarmKind::LockExpiry, LOCK_EXPIRY_KEY)).await.unwrap();
        assert!(f.supervisor.status().locked);
        assert!(f.alarms.get(AlarmKind::LockExpiry, LOCK_EXPIRY_KEY).is_some());
        f.supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_alarm_clears_the_lock() {
        let f = fixture();
        f.supervisor.start_lock(Duration::from_secs(60)).await.unwrap();
        let mut events = f.supervisor.subscribe();
        // Stop the loops so only the alarm path can clear the lock.
        f.supervisor.shutdown();
        tokio::time::advance(Duration::from_secs(61)).await;
        f.supervisor.on_alarm(fire(&f, AlarmKind::LockExpiry, LOCK_EXPIRY_KEY)).await.unwrap();
        assert!(!f.supervisor.status().locked);
        assert!(f.alarms.is_empty());
        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::LockDeactivated { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec![DeactivationReason::Expired]);
    }

    #[tokio::test(start_paused = true)]
    async fn task_removed_arms_a_throttled_restart() {
        let f = fixture();
        f.supervisor.on_lifecycle(LifecycleSignal::TaskRemoved).await.unwrap();
        assert!(f.alarms.get(AlarmKind::ProcessRestart, ENFORCEMENT_RESTART_TARGET).is_none());

        f.supervisor.start_lock(Duration::from_secs(3600)).await.unwrap();
        f.supervisor.on_lifecycle(LifecycleSignal::TaskRemoved).await.unwrap();
        assert!(f.alarms.get(AlarmKind::ProcessRestart, ENFORCEMENT_RESTART_TARGET).is_some());
        f.supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn locked_boot_cancels_the_fallback_job() {
        let f = fixture();
        f.supervisor.on_lifecycle(LifecycleSignal::UserUnlocked).await.unwrap();
        assert!(f.supervisor.scheduler().is_fallback_armed());
        f.supervisor.on_lifecycle(LifecycleSignal::LockedBootCompleted).await.unwrap();
        assert!(!f.supervisor.scheduler().is_fallback_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_surface_leaves_nothing_running() {
        let f = fixture();
        f.host.reject_with("no overlay grant");
        assert!(f.supervisor.start_lock(Duration::from_secs(3600)).await.is_err());
        assert!(!f.supervisor.is_enforcing());
        assert!(f.supervisor.status().detached);

        // The next heartbeat gets one fresh attempt.
        f.host.accept();
        f.supervisor.on_alarm(fire(&f, AlarmKind::Heartbeat, HEARTBEAT_KEY)).await.unwrap();
        assert!(f.supervisor.is_enforcing());
        f.supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_unlock_clears_everything() {
        let f = fixture();
        f.supervisor.start_lock(Duration::from_secs(3600)).await.unwrap();
        f.supervisor.begin_emergency_unlock().await;
        assert!(f.supervisor.engine().shared().is_emergency_flow());
        assert!(f.supervisor.emergency_unlock_succeeded().await.unwrap());
        assert!(!f.supervisor.engine().shared().is_emergency_flow());
        assert!(!f.supervisor.status().locked);
        assert!(f.alarms.is_empty());
    }
}
