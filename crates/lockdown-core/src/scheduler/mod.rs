//! Layered resilience scheduling.
//!
//! Three idempotent one-shot alarm kinds keep enforcement alive across
//! process death and missed timers:
//! - **Heartbeat**: periodic self-check while locked.
//! - **LockExpiry**: one-shot at the lock end.
//! - **ProcessRestart**: relaunch shortly after the task is removed,
//!   throttled per target.
//!
//! Boot signals add a few short retry fires, and a coarse periodic job
//! backs up the heartbeat when the primary alarms are restricted.
//! Exact alarms fall back to inexact ones when the privilege is missing.

pub mod alarms;

pub use alarms::{
    AlarmBackend, AlarmFire, AlarmId, AlarmKind, PeriodicJobBackend, Precision, TokioAlarms,
};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::SchedulingError;
use crate::events::{Event, EventBus};
use crate::storage::ScheduleConfig;
use crate::throttle::{ThrottleDomain, ThrottleLedger};

pub const HEARTBEAT_KEY: &str = "heartbeat";
pub const LOCK_EXPIRY_KEY: &str = "lock_expiry";
pub const FALLBACK_JOB: &str = "lockdown-fallback-heartbeat";

fn boot_retry_key(index: usize) -> String {
    format!("boot_retry_{index}")
}

pub struct ResilienceScheduler {
    alarms: Arc<dyn AlarmBackend>,
    jobs: Arc<dyn PeriodicJobBackend>,
    throttle: Arc<ThrottleLedger>,
    clock: Arc<dyn Clock>,
    schedule: ScheduleConfig,
    events: EventBus,
    restart_targets: Mutex<HashSet<String>>,
    boot_retries: Mutex<usize>,
    fallback_armed: AtomicBool,
}

impl ResilienceScheduler {
    pub fn new(
        alarms: Arc<dyn AlarmBackend>,
        jobs: Arc<dyn PeriodicJobBackend>,
        throttle: Arc<ThrottleLedger>,
        clock: Arc<dyn Clock>,
        schedule: ScheduleConfig,
        events: EventBus,
    ) -> Self {
        Self {
            alarms,
            jobs,
            throttle,
            clock,
            schedule,
            events,
            restart_targets: Mutex::new(HashSet::new()),
            boot_retries: Mutex::new(0),
            fallback_armed: AtomicBool::new(false),
        }
    }

    pub fn arm_heartbeat(&self) -> Result<Precision, SchedulingError> {
        let at = self.after(self.schedule.heartbeat_period());
        self.arm(&AlarmId::new(AlarmKind::Heartbeat, HEARTBEAT_KEY), at)
    }

    pub fn arm_lock_expiry(&self, end: DateTime<Utc>) -> Result<Precision, SchedulingError> {
        self.arm(&AlarmId::new(AlarmKind::LockExpiry, LOCK_EXPIRY_KEY), end)
    }

    /// Arm a relaunch of `target`. `Ok(None)` when the target was re-armed
    /// less than the minimum interval ago.
    pub fn arm_process_restart(&self, target: &str) -> Result<Option<Precision>, SchedulingError> {
        if !self.throttle.should_trigger(ThrottleDomain::ProcessRestart, target) {
            tracing::debug!(target, "process restart recently armed, skipping");
            return Ok(None);
        }
        let at = self.after(self.schedule.process_restart_delay());
        let precision = self.arm(&AlarmId::new(AlarmKind::ProcessRestart, target), at)?;
        self.restart_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.to_string());
        tracing::info!(target, "process restart armed");
        Ok(Some(precision))
    }

    /// Arm the short post-boot retry fires. Returns how many were armed.
    pub fn arm_boot_retries(&self) -> Result<usize, SchedulingError> {
        let offsets = self.schedule.boot_retry_offsets();
        let mut armed = 0;
        let mut last_err = None;
        for (i, offset) in offsets.iter().enumerate() {
            match self.arm(&AlarmId::new(AlarmKind::BootRetry, boot_retry_key(i)), self.after(*offset)) {
                Ok(_) => armed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, offset_secs = offset.as_secs(), "boot retry not armed");
                    last_err = Some(e);
                }
            }
        }
        {
            let mut count = self.boot_retries.lock().unwrap_or_else(|e| e.into_inner());
            *count = (*count).max(offsets.len());
        }
        match last_err {
            Some(e) if armed == 0 && !offsets.is_empty() => Err(e),
            _ => Ok(armed),
        }
    }

    pub fn arm_fallback_job(&self) -> Result<(), SchedulingError> {
        self.jobs
            .schedule_periodic(FALLBACK_JOB, self.schedule.fallback_job_period())?;
        if !self.fallback_armed.swap(true, Ordering::AcqRel) {
            tracing::info!("fallback job armed");
        }
        Ok(())
    }

    /// Cancel the fallback job; used while storage is in a pre-unlock state.
    pub fn cancel_fallback_job(&self) -> Result<(), SchedulingError> {
        self.jobs.cancel_job(FALLBACK_JOB)?;
        if self.fallback_armed.swap(false, Ordering::AcqRel) {
            tracing::info!("fallback job cancelled");
        }
        Ok(())
    }

    pub fn is_fallback_armed(&self) -> bool {
        self.fallback_armed.load(Ordering::Acquire)
    }

    /// Cancel heartbeat, expiry, boot retries and pending restarts.
    /// The fallback job is left alone.
    pub fn cancel_enforcement_alarms(&self) {
        let mut ids = vec![
            AlarmId::new(AlarmKind::Heartbeat, HEARTBEAT_KEY),
            AlarmId::new(AlarmKind::LockExpiry, LOCK_EXPIRY_KEY),
        ];
        let retries = std::mem::take(&mut *self.boot_retries.lock().unwrap_or_else(|e| e.into_inner()));
        ids.extend((0..retries).map(|i| AlarmId::new(AlarmKind::BootRetry, boot_retry_key(i))));
        let targets = std::mem::take(&mut *self.restart_targets.lock().unwrap_or_else(|e| e.into_inner()));
        ids.extend(
            targets
                .into_iter()
                .map(|t| AlarmId::new(AlarmKind::ProcessRestart, t)),
        );
        for id in ids {
            if let Err(e) = self.alarms.cancel(&id) {
                tracing::warn!(alarm = %id, error = %e, "failed to cancel alarm");
            }
        }
        tracing::debug!("enforcement alarms cancelled");
    }

    fn arm(&self, id: &AlarmId, at: DateTime<Utc>) -> Result<Precision, SchedulingError> {
        match self.alarms.set_exact(id, at) {
            Ok(()) => Ok(Precision::Exact),
            Err(SchedulingError::ExactDenied) => {
                tracing::warn!(alarm = %id, "exact alarm denied, falling back to inexact");
                self.events.emit(Event::SchedulingDegraded {
                    kind: id.kind,
                    reason: SchedulingError::ExactDenied.to_string(),
                    at: self.clock.now(),
                });
                self.alarms.set_inexact(id, at)?;
                Ok(Precision::Inexact)
            }
            Err(e) => Err(e),
        }
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.now() + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::EngineConfig;
    use crate::testing::InMemoryAlarms;
    use crate::throttle::ThrottleIntervals;

    fn scheduler(alarms: Arc<InMemoryAlarms>, clock: Arc<ManualClock>) -> ResilienceScheduler {
        let config = EngineConfig::default();
        ResilienceScheduler::new(
            alarms.clone(),
            alarms,
            Arc::new(ThrottleLedger::new(ThrottleIntervals::from_config(&config), clock.clone())),
            clock,
            config.schedule,
            EventBus::new(),
        )
    }

    #[test]
    fn heartbeat_is_armed_one_period_out() {
        let alarms = Arc::new(InMemoryAlarms::new());
        let clock = Arc::new(ManualClock::default());
        let s = scheduler(alarms.clone(), clock.clone());
        assert_eq!(s.arm_heartbeat().unwrap(), Precision::Exact);
        let (at, precision) = alarms.get(AlarmKind::Heartbeat, HEARTBEAT_KEY).unwrap();
        assert_eq!((at - clock.now()).num_minutes(), 15);
        assert_eq!(precision, Precision::Exact);

        // Idempotent.
        s.arm_heartbeat().unwrap();
        assert_eq!(alarms.len(), 1);
    }

    #[test]
    fn exact_denial_degrades_to_inexact() {
        let alarms = Arc::new(InMemoryAlarms::new());
        alarms.deny_exact(true);
        let clock = Arc::new(ManualClock::default());
        let s = scheduler(alarms.clone(), clock.clone());
        let mut events = s.events.subscribe();
        let end = clock.now() + chrono::Duration::hours(1);
        assert_eq!(s.arm_lock_expiry(end).unwrap(), Precision::Inexact);
        assert_eq!(alarms.get(AlarmKind::LockExpiry, LOCK_EXPIRY_KEY), Some((end, Precision::Inexact)));
        assert!(matches!(
            events.try_recv(),
            Ok(Event::SchedulingDegraded { kind: AlarmKind::LockExpiry, .. })
        ));
    }

    #[test]
    fn process_restart_is_throttled_per_target() {
        let alarms = Arc::new(InMemoryAlarms::new());
        let clock = Arc::new(ManualClock::default());
        let s = scheduler(alarms.clone(), clock.clone());
        assert!(s.arm_process_restart("enforcement").unwrap().is_some());
        assert!(s.arm_process_restart("enforcement").unwrap().is_none());
        assert!(s.arm_process_restart("presentation").unwrap().is_some());
        clock.advance(Duration::from_secs(60));
        assert!(s.arm_process_restart("enforcement").unwrap().is_some());
    }

    #[test]
    fn boot_retries_follow_configured_offsets() {
        let alarms = Arc::new(InMemoryAlarms::new());
        let clock = Arc::new(ManualClock::default());
        let s = scheduler(alarms.clone(), clock.clone());
        assert_eq!(s.arm_boot_retries().unwrap(), 3);
        let offsets: Vec<i64> = (0..3)
            .map(|i| {
                let (at, _) = alarms.get(AlarmKind::BootRetry, &boot_retry_key(i)).unwrap();
                (at - clock.now()).num_seconds()
            })
            .collect();
        assert_eq!(offsets, vec![5, 30, 90]);
    }

    #[test]
    fn cancel_leaves_only_the_fallback_job() {
        let alarms = Arc::new(InMemoryAlarms::new());
        let clock = Arc::new(ManualClock::default());
        let s = scheduler(alarms.clone(), clock.clone());
        s.arm_heartbeat().unwrap();
        s.arm_lock_expiry(clock.now() + chrono::Duration::hours(1)).unwrap();
        s.arm_boot_retries().unwrap();
        s.arm_process_restart("enforcement").unwrap();
        s.arm_fallback_job().unwrap();

        s.cancel_enforcement_alarms();
        assert_eq!(alarms.len(), 0);
        assert!(alarms.has_job(FALLBACK_JOB));
        assert!(s.is_fallback_armed());

        s.cancel_fallback_job().unwrap();
        assert!(!alarms.has_job(FALLBACK_JOB));
        assert!(!s.is_fallback_armed());
    }

    #[test]
    fn backend_failures_propagate() {
        let alarms = Arc::new(InMemoryAlarms::new());
        alarms.fail_all(true);
        let s = scheduler(alarms, Arc::new(ManualClock::default()));
        assert!(matches!(s.arm_heartbeat(), Err(SchedulingError::Backend(_))));
        assert!(s.arm_boot_retries().is_err());
    }
}
