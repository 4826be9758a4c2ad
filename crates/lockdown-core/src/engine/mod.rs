//! Enforcement engine.
//!
//! Consumes foreground samples and lock-state changes, decides under the
//! package policy and its exception windows whether to redirect, and sends
//! [`PresentationCommand`]s to the presentation controller.
//!
//! ## Decision order
//!
//! 1. Emergency-unlock flow: everything but this app is sent to the
//!    emergency surface (short throttle).
//! 2. During an allowed-app launch or session, this app and transient
//!    packages are ignored.
//! 3. Allowed app: mark it frontmost, extend the session, refresh the
//!    overlay suppression.
//! 4. Leaving a session: the same package must be seen again after the
//!    confirmation window. A confirmed launcher brings the overlay back; a
//!    confirmed app falls through.
//! 5. Permission-recovery excursion: no redirects.
//! 6. Settings surfaces get a redirect burst; anything else a throttled
//!    overlay re-show.

pub mod burst;
pub mod policy;
pub mod state;

pub use burst::{BurstContext, BurstStart, RedirectBurst};
pub use policy::{PackageClass, PackagePolicy};
pub use state::{ExitProgress, FlagsSnapshot, SharedState};

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{CoreError, ForegroundError, Result};
use crate::events::{Event, EventBus, Permission, RedirectKind};
use crate::foreground::ForegroundSample;
use crate::lock_state::{LockState, LockStateChange, LockStore};
use crate::presentation::PresentationCommand;
use crate::session::SessionStore;
use crate::storage::EngineConfig;
use crate::storage::TimingConfig;
use crate::throttle::{ThrottleDomain, ThrottleLedger};
use crate::wakelock::WakeLock;

/// What the engine decided for one foreground sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not locked, or not connected to a controller.
    Inactive,
    OwnApp,
    EmergencyRedirect,
    IgnoredTransient,
    AllowedForeground { refresh_suppression: bool },
    SessionExitPending,
    SessionExited { force_overlay: bool },
    RecoveryExcursion,
    BurstStarted,
    BurstRunning,
    OverlayForced,
    Throttled,
}

impl Decision {
    /// Whether this decision pushes the package away from the foreground.
    pub fn is_redirect(self) -> bool {
        matches!(
            self,
            Decision::EmergencyRedirect
                | Decision::SessionExited { force_overlay: true }
                | Decision::BurstStarted
                | Decision::OverlayForced
        )
    }
}

/// Shared collaborators of the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<LockStore>,
    pub sessions: Arc<SessionStore>,
    pub throttle: Arc<ThrottleLedger>,
    pub shared: Arc<SharedState>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub events: EventBus,
}

struct Link {
    commands: mpsc::Sender<PresentationCommand>,
    cancel: CancellationToken,
}

pub struct EnforcementEngine {
    policy: PackagePolicy,
    timing: TimingConfig,
    clock: Arc<dyn Clock>,
    store: Arc<LockStore>,
    sessions: Arc<SessionStore>,
    throttle: Arc<ThrottleLedger>,
    shared: Arc<SharedState>,
    wake_lock: Arc<dyn WakeLock>,
    events: EventBus,
    burst: Arc<RedirectBurst>,
    link: Mutex<Option<Link>>,
}

impl EnforcementEngine {
    pub fn new(config: &EngineConfig, deps: EngineDeps) -> Self {
        Self {
            policy: PackagePolicy::from_config(&config.packages),
            timing: config.timing.clone(),
            clock: deps.store.clock().clone(),
            store: deps.store,
            sessions: deps.sessions,
            throttle: deps.throttle,
            shared: deps.shared,
            wake_lock: deps.wake_lock,
            events: deps.events,
            burst: Arc::new(RedirectBurst::from_timing(&config.timing)),
            link: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &PackagePolicy {
        &self.policy
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn is_bursting(&self) -> bool {
        self.burst.is_running()
    }

    /// Route commands to a controller. Bursts started from now on are
    /// children of `cancel`.
    pub fn connect(&self, commands: mpsc::Sender<PresentationCommand>, cancel: CancellationToken) {
        *self.link_guard() = Some(Link { commands, cancel });
    }

    pub fn disconnect(&self) {
        self.link_guard().take();
        self.burst.cancel();
    }

    /// Track a committed lock state.
    pub fn on_lock_state(&self, state: &LockState) {
        let was = self.shared.is_locked();
        self.shared.set_locked(state.is_locked());
        if !state.is_locked() {
            self.burst.cancel();
        }
        if was != state.is_locked() {
            tracing::debug!(locked = state.is_locked(), "engine observed lock state");
        }
    }

    /// Run the decision algorithm for `package`, updating throttles and the
    /// session store. Sends nothing.
    pub fn evaluate(&self, package: &str) -> Decision {
        if !self.shared.is_locked() {
            return Decision::Inactive;
        }
        let target = self.sessions.allowed_package();
        let class = self.policy.classify(package, target.as_deref());

        if self.shared.is_emergency_flow() {
            if class == PackageClass::Own {
                return Decision::OwnApp;
            }
            return if self.throttle.should_trigger(ThrottleDomain::EmergencyRedirect, package) {
                Decision::EmergencyRedirect
            } else {
                Decision::Throttled
            };
        }

        if matches!(class, PackageClass::Own | PackageClass::Transient)
            && (self.sessions.is_launch_in_progress() || self.sessions.is_session_active())
        {
            return Decision::IgnoredTransient;
        }
        if class == PackageClass::Own {
            return Decision::OwnApp;
        }

        if class == PackageClass::Allowed {
            return self.allowed_in_front(package);
        }

        if class != PackageClass::Transient
            && (self.shared.is_allowed_foreground() || self.sessions.is_session_active())
        {
            let now = self.clock.uptime_ms();
            match self
                .shared
                .observe_exit_candidate(package, now, self.timing.session_exit_confirm())
            {
                ExitProgress::Pending => return Decision::SessionExitPending,
                ExitProgress::Confirmed => {
                    self.end_session(target);
                    self.throttle.reset(ThrottleDomain::OverlayForce, package);
                    if class == PackageClass::Launcher {
                        let force_overlay = !self.shared.is_recovery_excursion();
                        if force_overlay {
                            self.throttle.should_trigger(ThrottleDomain::OverlayForce, package);
                        }
                        return Decision::SessionExited { force_overlay };
                    }
                }
            }
        }

        // In recovery mode only the way to the permission screen is let through.
        if self.shared.is_recovery_excursion()
            || (self.shared.is_recovery_mode() && self.policy.is_permission_settings(package))
        {
            return Decision::RecoveryExcursion;
        }

        if self.policy.is_force_redirect(package) {
            if self.burst.is_running() {
                return Decision::BurstRunning;
            }
            return if self.throttle.should_trigger(ThrottleDomain::UiRedirect, package) {
                Decision::BurstStarted
            } else {
                Decision::Throttled
            };
        }
        if self.throttle.should_trigger(ThrottleDomain::OverlayForce, package) {
            Decision::OverlayForced
        } else {
            Decision::Throttled
        }
    }

    /// Evaluate `package` and act on the decision.
    pub async fn on_foreground(&self, package: &str) -> Decision {
        let Some((commands, cancel)) = self.link() else {
            return Decision::Inactive;
        };
        let decision = self.evaluate(package);
        tracing::trace!(package, ?decision, "foreground evaluated");

        let send = |command| {
            let commands = commands.clone();
            async move {
                if commands.send(command).await.is_err() {
                    tracing::debug!(?command, "presentation controller gone");
                }
            }
        };
        match decision {
            Decision::EmergencyRedirect => {
                send(PresentationCommand::OpenEmergencyUnlock).await;
                self.emit_redirect(package, RedirectKind::Emergency);
            }
            Decision::AllowedForeground {
                refresh_suppression: true,
            } => send(PresentationCommand::RefreshSuppression).await,
            Decision::SessionExited { force_overlay } => {
                send(PresentationCommand::ClearSuppression).await;
                if force_overlay {
                    send(PresentationCommand::ForceShow).await;
                    self.emit_redirect(package, RedirectKind::Overlay);
                }
            }
            Decision::BurstStarted => {
                let ctx = BurstContext {
                    commands: commands.clone(),
                    shared: self.shared.clone(),
                    sessions: self.sessions.clone(),
                    wake_lock: self.wake_lock.clone(),
                    wake_lock_max: self.timing.wake_lock_max(),
                    events: self.events.clone(),
                    clock: self.clock.clone(),
                };
                self.burst.start(package, ctx, &cancel);
            }
            Decision::OverlayForced => {
                send(PresentationCommand::ForceShow).await;
                self.emit_redirect(package, RedirectKind::Overlay);
            }
            _ => {}
        }
        decision
    }

    /// Open the emergency-unlock surface and keep sending everything else
    /// there until [`end_emergency_flow`](Self::end_emergency_flow).
    pub async fn begin_emergency_flow(&self) {
        if !self.shared.set_emergency_flow(true) {
            tracing::info!("emergency unlock flow started");
        }
        self.burst.cancel();
        self.throttle.reset_domain(ThrottleDomain::EmergencyRedirect);
        if let Some((commands, _)) = self.link() {
            if commands.send(PresentationCommand::OpenEmergencyUnlock).await.is_err() {
                tracing::debug!("presentation controller gone");
            }
        }
    }

    pub fn end_emergency_flow(&self) {
        if self.shared.set_emergency_flow(false) {
            tracing::info!("emergency unlock flow ended");
        }
    }

    /// The user picked an allow-list shortcut: remember the target and open
    /// the launch window.
    pub fn begin_allowed_launch(&self, package: &str) -> Result<()> {
        if package.is_empty()
            || package == self.policy.own_package()
            || self.policy.is_force_redirect(package)
            || self.policy.classify(package, None) == PackageClass::Launcher
        {
            return Err(CoreError::PackageNotAllowed(package.to_string()));
        }
        self.sessions
            .begin_allowed_launch(package, self.timing.launch_ttl(), self.timing.session_ttl())?;
        self.throttle.reset(ThrottleDomain::AllowedSuppress, package);
        self.burst.cancel();
        tracing::info!(package, "allowed app launch started");
        Ok(())
    }

    /// Consume foreground samples and lock-state changes until `cancel`.
    pub async fn run(
        self: Arc<Self>,
        mut samples: mpsc::Receiver<ForegroundSample>,
        mut changes: broadcast::Receiver<LockStateChange>,
        cancel: CancellationToken,
    ) {
        let mut usage_denied = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => self.on_lock_state(&change.state),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "lock state notifications lagged, re-reading");
                        match self.store.read() {
                            Ok(state) => self.on_lock_state(&state),
                            Err(e) => tracing::warn!(error = %e, "lock state re-read failed"),
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                sample = samples.recv() => match sample {
                    Some(ForegroundSample::Package(package)) => {
                        usage_denied = false;
                        self.on_foreground(&package).await;
                    }
                    Some(ForegroundSample::Unavailable(ForegroundError::PermissionDenied)) => {
                        if !usage_denied {
                            tracing::warn!("usage access denied, enforcement blind until granted");
                            self.events.emit(Event::PermissionDenied {
                                permission: Permission::UsageAccess,
                                at: self.clock.now(),
                            });
                        }
                        usage_denied = true;
                    }
                    Some(ForegroundSample::Unavailable(e)) => {
                        tracing::debug!(error = %e, "no foreground signal this tick");
                    }
                    None => break,
                },
            }
        }
        self.burst.cancel();
        tracing::debug!("enforcement loop stopped");
    }

    fn allowed_in_front(&self, package: &str) -> Decision {
        let fresh = !self.shared.is_allowed_foreground();
        self.shared.set_allowed_foreground(true);
        if let Err(e) = self.sessions.extend_session(self.timing.session_ttl()) {
            tracing::warn!(error = %e, package, "failed to extend allowed session");
        }
        if fresh {
            tracing::info!(package, "allowed app in front");
            self.events.emit(Event::SessionStarted {
                package: package.to_string(),
                at: self.clock.now(),
            });
        }
        let refresh_suppression = self.throttle.should_trigger(ThrottleDomain::AllowedSuppress, package);
        Decision::AllowedForeground { refresh_suppression }
    }

    fn end_session(&self, target: Option<String>) {
        if let Err(e) = self.sessions.clear() {
            tracing::warn!(error = %e, "failed to clear allowed session");
        }
        self.shared.set_allowed_foreground(false);
        self.throttle.reset_domain(ThrottleDomain::AllowedSuppress);
        tracing::info!(package = ?target, "allowed session ended");
        self.events.emit(Event::SessionEnded {
            package: target,
            at: self.clock.now(),
        });
    }

    fn emit_redirect(&self, package: &str, kind: RedirectKind) {
        tracing::debug!(package, ?kind, "redirect issued");
        self.events.emit(Event::RedirectIssued {
            package: package.to_string(),
            kind,
            at: self.clock.now(),
        });
    }

    fn link(&self) -> Option<(mpsc::Sender<PresentationCommand>, CancellationToken)> {
        self.link_guard()
            .as_ref()
            .map(|l| (l.commands.clone(), l.cancel.clone()))
    }

    fn link_guard(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}
