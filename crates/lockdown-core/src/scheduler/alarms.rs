//! Alarm backends.
//!
//! An alarm is identified by `(kind, key)`; arming the same identity again
//! replaces the earlier alarm instead of adding a second one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::SchedulingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// Periodic self-check while locked.
    Heartbeat,
    /// One-shot at the lock end.
    LockExpiry,
    /// Relaunch after the task was removed.
    ProcessRestart,
    /// Short one-offs after a boot signal.
    BootRetry,
    /// The coarse periodic job.
    FallbackJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlarmId {
    pub kind: AlarmKind,
    pub key: String,
}

impl AlarmId {
    pub fn new(kind: AlarmKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.key)
    }
}

/// Delivered when an alarm goes off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmFire {
    pub id: AlarmId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Exact,
    Inexact,
}

/// One-shot alarms.
pub trait AlarmBackend: Send + Sync {
    /// # Errors
    /// [`SchedulingError::ExactDenied`] when the exact-alarm privilege is
    /// missing.
    fn set_exact(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), SchedulingError>;

    fn set_inexact(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), SchedulingError>;

    fn cancel(&self, id: &AlarmId) -> Result<(), SchedulingError>;
}

/// Coarse periodic jobs, scheduled independently of [`AlarmBackend`].
pub trait PeriodicJobBackend: Send + Sync {
    fn schedule_periodic(&self, job: &str, period: Duration) -> Result<(), SchedulingError>;

    fn cancel_job(&self, job: &str) -> Result<(), SchedulingError>;
}

struct Armed {
    generation: u64,
    at: DateTime<Utc>,
    precision: Precision,
    task: JoinHandle<()>,
}

type ArmedTable = Arc<Mutex<HashMap<AlarmId, Armed>>>;

/// In-process backend on tokio timers. Fires are delivered over the channel
/// returned by [`TokioAlarms::new`].
pub struct TokioAlarms {
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<AlarmFire>,
    exact_allowed: AtomicBool,
    next_generation: AtomicU64,
    armed: ArmedTable,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioAlarms {
    pub fn new(clock: Arc<dyn Clock>) -> (Arc<Self>, mpsc::Receiver<AlarmFire>) {
        let (tx, rx) = mpsc::channel(64);
        let alarms = Arc::new(Self {
            clock,
            tx,
            exact_allowed: AtomicBool::new(true),
            next_generation: AtomicU64::new(1),
            armed: Arc::new(Mutex::new(HashMap::new())),
            jobs: Mutex::new(HashMap::new()),
        });
        (alarms, rx)
    }

    /// Grant or revoke the exact-alarm privilege.
    pub fn set_exact_allowed(&self, allowed: bool) {
        self.exact_allowed.store(allowed, Ordering::Relaxed);
    }

    /// Pending alarms, soonest first.
    pub fn pending(&self) -> Vec<(AlarmId, DateTime<Utc>, Precision)> {
        let table = lock(&self.armed);
        let mut out: Vec<_> = table
            .iter()
            .map(|(id, a)| (id.clone(), a.at, a.precision))
            .collect();
        out.sort_by_key(|(_, at, _)| *at);
        out
    }

    pub fn is_armed(&self, id: &AlarmId) -> bool {
        lock(&self.armed).contains_key(id)
    }

    pub fn has_job(&self, job: &str) -> bool {
        lock(&self.jobs).contains_key(job)
    }

    fn arm(&self, id: &AlarmId, at: DateTime<Utc>, precision: Precision) -> Result<(), SchedulingError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulingError::Backend(e.to_string()))?;
        let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let table = Arc::clone(&self.armed);
        let tx = self.tx.clone();
        let clock = Arc::clone(&self.clock);
        let fired = id.clone();

        // Held across the spawn so the task cannot look itself up before
        // its entry exists.
        let mut armed = lock(&self.armed);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut table = lock(&table);
                match table.get(&fired) {
                    Some(a) if a.generation == generation => {
                        table.remove(&fired);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                let _ = tx.send(AlarmFire { id: fired, at: clock.now() }).await;
            }
        });
        let previous = armed.insert(
            id.clone(),
            Armed {
                generation,
                at,
                precision,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        tracing::debug!(alarm = %id, ?precision, delay_ms = delay.as_millis() as u64, "alarm armed");
        Ok(())
    }
}

impl AlarmBackend for TokioAlarms {
    fn set_exact(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), SchedulingError> {
        if !self.exact_allowed.load(Ordering::Relaxed) {
            return Err(SchedulingError::ExactDenied);
        }
        self.arm(id, at, Precision::Exact)
    }

    fn set_inexact(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<(), SchedulingError> {
        self.arm(id, at, Precision::Inexact)
    }

    fn cancel(&self, id: &AlarmId) -> Result<(), SchedulingError> {
        if let Some(armed) = lock(&self.armed).remove(id) {
            armed.task.abort();
            tracing::debug!(alarm = %id, "alarm cancelled");
        }
        Ok(())
    }
}

impl PeriodicJobBackend for TokioAlarms {
    fn schedule_periodic(&self, job: &str, period: Duration) -> Result<(), SchedulingError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulingError::Backend(e.to_string()))?;
        let tx = self.tx.clone();
        let clock = Arc::clone(&self.clock);
        let id = AlarmId::new(AlarmKind::FallbackJob, job);
        let task = runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let fire = AlarmFire {
                    id: id.clone(),
                    at: clock.now(),
                };
                if tx.send(fire).await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = lock(&self.jobs).insert(job.to_string(), task) {
            previous.abort();
        }
        tracing::debug!(job, period_secs = period.as_secs(), "periodic job scheduled");
        Ok(())
    }

    fn cancel_job(&self, job: &str) -> Result<(), SchedulingError> {
        if let Some(task) = lock(&self.jobs).remove(job) {
            task.abort();
            tracing::debug!(job, "periodic job cancelled");
        }
        Ok(())
    }
}

impl Drop for TokioAlarms {
    fn drop(&mut self) {
        for (_, armed) in lock(&self.armed).drain() {
            armed.task.abort();
        }
        for (_, task) in lock(&self.jobs).drain() {
            task.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
