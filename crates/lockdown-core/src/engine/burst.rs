//! Redirect burst.
//!
//! Some OS surfaces (settings, permission brokers) regain focus right after
//! a single redirect. A burst re-asserts the blocking surface on a fixed
//! cadence for a bounded window instead. At most one burst runs at a time;
//! it stops early when the lock is deactivated, when an allowed-app session
//! begins, or when its cancellation token fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::SharedState;
use crate::clock::Clock;
use crate::events::{BurstOutcome, Event, EventBus, RedirectKind};
use crate::presentation::PresentationCommand;
use crate::session::SessionStore;
use crate::storage::TimingConfig;
use crate::wakelock::{WakeLock, WakeLockGuard};

/// What a burst needs from the engine.
#[derive(Clone)]
pub struct BurstContext {
    pub commands: mpsc::Sender<PresentationCommand>,
    pub shared: Arc<SharedState>,
    pub sessions: Arc<SessionStore>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub wake_lock_max: Duration,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstStart {
    Started,
    AlreadyRunning,
}

struct Running {
    id: u64,
    package: String,
    cancel: CancellationToken,
}

pub struct RedirectBurst {
    window: Duration,
    interval: Duration,
    next_id: AtomicU64,
    running: Mutex<Option<Running>>,
}

impl RedirectBurst {
    pub fn new(window: Duration, interval: Duration) -> Self {
        Self {
            window,
            interval,
            next_id: AtomicU64::new(1),
            running: Mutex::new(None),
        }
    }

    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self::new(timing.redirect_burst_window(), timing.redirect_burst_interval())
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Package the running burst was started for.
    pub fn target(&self) -> Option<String> {
        self.lock().as_ref().map(|r| r.package.clone())
    }

    /// Start a burst for `package` under `parent`. Returns the task handle
    /// when a new burst was started.
    pub fn start(
        self: &Arc<Self>,
        package: &str,
        ctx: BurstContext,
        parent: &CancellationToken,
    ) -> (BurstStart, Option<JoinHandle<BurstOutcome>>) {
        let mut running = self.lock();
        if running.is_some() {
            return (BurstStart::AlreadyRunning, None);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        *running = Some(Running {
            id,
            package: package.to_string(),
            cancel: cancel.clone(),
        });
        drop(running);

        tracing::info!(package, window_ms = self.window.as_millis() as u64, "redirect burst started");
        ctx.events.emit(Event::BurstStarted {
            package: package.to_string(),
            at: ctx.clock.now(),
        });

        let this = Arc::clone(self);
        let package = package.to_string();
        let handle = tokio::spawn(async move {
            let (outcome, redirects) = this.drive(&package, &ctx, &cancel).await;
            this.finish(id);
            tracing::info!(package = %package, ?outcome, redirects, "redirect burst finished");
            ctx.events.emit(Event::BurstFinished {
                package,
                outcome,
                redirects,
                at: ctx.clock.now(),
            });
            outcome
        });
        (BurstStart::Started, Some(handle))
    }

    /// Stop the running burst, if any.
    pub fn cancel(&self) {
        if let Some(running) = self.lock().as_ref() {
            running.cancel.cancel();
        }
    }

    async fn drive(&self, package: &str, ctx: &BurstContext, cancel: &CancellationToken) -> (BurstOutcome, u32) {
        let _wake = WakeLockGuard::acquire(ctx.wake_lock.clone(), "redirect-burst", ctx.wake_lock_max);
        let deadline = Instant::now() + self.window;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut redirects = 0u32;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break BurstOutcome::Cancelled,
                _ = ticker.tick() => {}
            }
            if !ctx.shared.is_locked() {
                break BurstOutcome::LockDeactivated;
            }
            if ctx.shared.is_allowed_foreground()
                || ctx.sessions.is_session_active()
                || ctx.sessions.is_launch_in_progress()
            {
                break BurstOutcome::SessionStarted;
            }
            if Instant::now() >= deadline {
                break BurstOutcome::Completed;
            }
            if ctx.commands.send(PresentationCommand::ForceShow).await.is_err()
                || ctx.commands.send(PresentationCommand::BringToFront).await.is_err()
            {
                break BurstOutcome::Cancelled;
            }
            redirects += 1;
            tracing::trace!(package, redirects, "burst redirect");
            ctx.events.emit(Event::RedirectIssued {
                package: package.to_string(),
                kind: RedirectKind::Burst,
                at: ctx.clock.now(),
            });
        };
        (outcome, redirects)
    }

    fn finish(&self, id: u64) {
        let mut running = self.lock();
        if running.as_ref().map(|r| r.id) == Some(id) {
            *running = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::storage::{SqliteKv, Tier};
    use crate::testing::CountingWakeLock;

    struct Fixture {
        burst: Arc<RedirectBurst>,
        ctx: BurstContext,
        rx: mpsc::Receiver<PresentationCommand>,
        shared: Arc<SharedState>,
        sessions: Arc<SessionStore>,
        wake_lock: Arc<CountingWakeLock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(TokioClock::new());
        let (tx, rx) = mpsc::channel(256);
        let shared = Arc::new(SharedState::new());
        shared.set_locked(true);
        let sessions = Arc::new(SessionStore::new(
            Arc::new(SqliteKv::open_memory(Tier::Protected).unwrap()),
            clock.clone(),
            Duration::from_secs(10),
        ));
        let wake_lock = Arc::new(CountingWakeLock::default());
        let ctx = BurstContext {
            commands: tx,
            shared: shared.clone(),
            sessions: sessions.clone(),
            wake_lock: wake_lock.clone(),
            wake_lock_max: Duration::from_secs(10),
            events: EventBus::new(),
            clock,
        };
        Fixture {
            burst: Arc::new(RedirectBurst::new(Duration::from_millis(5_000), Duration::from_millis(400))),
            ctx,
            rx,
            shared,
            sessions,
            wake_lock,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<PresentationCommand>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[tokio::test(start_paused = true)]
    async fn runs_for_the_whole_window() {
        let mut f = fixture();
        let root = CancellationToken::new();
        let (start, handle) = f.burst.start("com.android.settings", f.ctx.clone(), &root);
        assert_eq!(start, BurstStart::Started);
        assert!(f.burst.is_running());

        let outcome = handle.unwrap().await.unwrap();
        assert_eq!(outcome, BurstOutcome::Completed);
        // Ticks at 0, 400, ..., 4800 ms.
        assert_eq!(drain(&mut f.rx), 13 * 2);
        assert!(!f.burst.is_running());
        assert_eq!(f.wake_lock.held(), 0);
        assert_eq!(f.wake_lock.acquisitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_burst_at_a_time() {
        let f = fixture();
        let root = CancellationToken::new();
        let (_, handle) = f.burst.start("com.android.settings", f.ctx.clone(), &root);
        let (second, none) = f.burst.start("com.android.packageinstaller", f.ctx.clone(), &root);
        assert_eq!(second, BurstStart::AlreadyRunning);
        assert!(none.is_none());
        assert_eq!(f.burst.target().as_deref(), Some("com.android.settings"));
        f.burst.cancel();
        assert_eq!(handle.unwrap().await.unwrap(), BurstOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_a_session_starts() {
        let f = fixture();
        let root = CancellationToken::new();
        let (_, handle) = f.burst.start("com.android.settings", f.ctx.clone(), &root);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        f.sessions.start_session(Duration::from_secs(30)).unwrap();
        assert_eq!(handle.unwrap().await.unwrap(), BurstOutcome::SessionStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_the_lock_is_deactivated() {
        let f = fixture();
        let root = CancellationToken::new();
        let (_, handle) = f.burst.start("com.android.settings", f.ctx.clone(), &root);
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        f.shared.set_locked(false);
        assert_eq!(handle.unwrap().await.unwrap(), BurstOutcome::LockDeactivated);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_reaches_the_burst() {
        let f = fixture();
        let root = CancellationToken::new();
        let (_, handle) = f.burst.start("com.android.settings", f.ctx.clone(), &root);
        root.cancel();
        assert_eq!(handle.unwrap().await.unwrap(), BurstOutcome::Cancelled);
        assert_eq!(f.wake_lock.held(), 0);
    }
}
