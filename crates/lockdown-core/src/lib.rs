//! # Lockdown Core Library
//!
//! This library keeps a time-boxed device lock enforced on a host that can
//! kill, restart or reboot it at any moment. The host forwards OS lifecycle
//! callbacks and alarm fires; everything else (foreground polling, redirect
//! decisions, the blocking surface, resilience alarms) runs here.
//!
//! ## Architecture
//!
//! - **Lock state**: durable `{is_locked, lock_start, lock_end}` in two
//!   storage tiers, one readable before credential unlock
//! - **Enforcement engine**: turns a polled foreground signal into redirect
//!   decisions under an allow-list and its exception windows
//! - **Presentation**: the blocking surface, its countdown and a
//!   permission-recovery mode
//! - **Resilience scheduling**: heartbeat, expiry and process-restart
//!   alarms plus post-boot retries
//!
//! ## Key Components
//!
//! - [`LockSupervisor`]: owns every component and the task lifecycle
//! - [`LockStore`]: dual-tier lock state with ordered change notification
//! - [`EnforcementEngine`]: per-sample decision algorithm
//! - [`PresentationController`]: surface mode state machine
//! - [`ResilienceScheduler`]: idempotent alarms

pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod foreground;
pub mod lock_state;
pub mod logging;
pub mod presentation;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod testing;
pub mod throttle;
pub mod wakelock;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use engine::{Decision, EnforcementEngine, PackageClass, PackagePolicy, SharedState};
pub use error::{ConfigError, CoreError, ForegroundError, PresentationError, SchedulingError, StorageError};
pub use events::{DeactivationReason, Event, EventBus};
pub use foreground::{ForegroundQuery, ForegroundSample, ForegroundSignal, UsageEvent};
pub use lock_state::{LockState, LockStateChange, LockStateSource, LockStore, ReconcileOutcome};
pub use presentation::{
    NotificationHost, PermissionProbe, PresentationCommand, PresentationController, PresentationHost,
    PresentationHosts, PresentationMode,
};
pub use scheduler::{AlarmBackend, AlarmFire, AlarmId, AlarmKind, PeriodicJobBackend, ResilienceScheduler, TokioAlarms};
pub use session::{AllowedSession, SessionStore};
pub use storage::{EngineConfig, KeyValueStore, SqliteKv, Tier};
pub use supervisor::{Collaborators, LifecycleSignal, LockStatus, LockSupervisor};
pub use throttle::{ThrottleDomain, ThrottleLedger};
pub use wakelock::{NoopWakeLock, WakeLock, WakeLockGuard};
