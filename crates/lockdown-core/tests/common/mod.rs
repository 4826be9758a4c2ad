//! Shared harness for the integration scenarios.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use lockdown_core::scheduler::{AlarmBackend, PeriodicJobBackend};
use lockdown_core::storage::{KeyValueStore, SqliteKv, Tier};
use lockdown_core::testing::{CountingWakeLock, InMemoryAlarms, RecordingHost, ScriptedForeground};
use lockdown_core::{Collaborators, EngineConfig, Event, LockSupervisor, TokioClock};
use tokio::sync::broadcast::{self, error::RecvError};

pub const OWN: &str = "app.lockdown";
pub const DIALER: &str = "com.google.android.dialer";
pub const LAUNCHER: &str = "com.android.launcher3";
pub const SETTINGS: &str = "com.android.settings";
pub const GAME: &str = "com.example.game";

/// Whole-second wall time so stored millisecond timestamps compare exactly.
pub fn anchor() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn clock_at(wall: DateTime<Utc>, uptime: Duration) -> Arc<TokioClock> {
    Arc::new(TokioClock::anchored_at(wall, uptime))
}

pub struct Harness {
    pub supervisor: Arc<LockSupervisor>,
    pub host: Arc<RecordingHost>,
    pub foreground: Arc<ScriptedForeground>,
    pub wake_lock: Arc<CountingWakeLock>,
    pub clock: Arc<TokioClock>,
}

impl Harness {
    pub fn new(
        protected: Arc<dyn KeyValueStore>,
        credential: Arc<dyn KeyValueStore>,
        clock: Arc<TokioClock>,
        alarms: Arc<dyn AlarmBackend>,
        jobs: Arc<dyn PeriodicJobBackend>,
    ) -> Self {
        let host = Arc::new(RecordingHost::new());
        let foreground = Arc::new(ScriptedForeground::new());
        foreground.set_foreground(OWN);
        let wake_lock = Arc::new(CountingWakeLock::default());
        let supervisor = LockSupervisor::new(
            EngineConfig::default(),
            Collaborators {
                protected,
                credential,
                foreground: foreground.clone(),
                hosts: host.hosts(),
                alarms,
                jobs,
                wake_lock: wake_lock.clone(),
                clock: clock.clone(),
            },
        )
        .unwrap();
        Self {
            supervisor,
            host,
            foreground,
            wake_lock,
            clock,
        }
    }

    /// In-memory tiers, both reachable.
    pub fn in_memory(alarms: &Arc<InMemoryAlarms>) -> Self {
        Self::new(
            Arc::new(SqliteKv::open_memory(Tier::Protected).unwrap()),
            Arc::new(SqliteKv::open_memory(Tier::Credential).unwrap()),
            clock_at(anchor(), Duration::from_secs(3600)),
            alarms.clone(),
            alarms.clone(),
        )
    }
}

/// Wait up to `within` for an event matching `pred`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<Event>, within: Duration, pred: F) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    let search = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(within, search).await.ok().flatten()
}

/// Everything emitted so far.
pub fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
