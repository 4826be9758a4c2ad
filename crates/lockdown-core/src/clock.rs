//! Time sources.
//!
//! Every component reads time through [`Clock`] so that boot-fencing,
//! throttling and countdowns can be exercised deterministically.

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Wall-clock time plus time since boot.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Time elapsed since the device booted.
    fn uptime(&self) -> Duration;

    /// Estimated wall-clock time of the last boot.
    ///
    /// Stable across calls within one boot (modulo wall-clock adjustments);
    /// jumps forward after a reboot.
    fn boot_epoch(&self) -> DateTime<Utc> {
        let uptime = chrono::Duration::from_std(self.uptime()).unwrap_or_else(|_| chrono::Duration::zero());
        self.now() - uptime
    }

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Monotonic milliseconds for elapsed-time checks. Unaffected by wall
    /// clock steps; only meaningful within one boot.
    fn uptime_ms(&self) -> i64 {
        i64::try_from(self.uptime().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Production clock: `chrono` wall time and the kernel's uptime counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn uptime(&self) -> Duration {
        kernel_uptime().unwrap_or_else(process_uptime)
    }
}

#[cfg(target_os = "linux")]
fn kernel_uptime() -> Option<Duration> {
    let raw = std::fs::read_to_string("/proc/uptime").ok()?;
    let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
    Some(Duration::from_secs_f64(secs))
}

#[cfg(not(target_os = "linux"))]
fn kernel_uptime() -> Option<Duration> {
    None
}

// Without a kernel counter, the process start stands in for the boot.
fn process_uptime() -> Duration {
    static STARTED: OnceLock<std::time::Instant> = OnceLock::new();
    STARTED.get_or_init(std::time::Instant::now).elapsed()
}

/// Clock that follows the tokio runtime's notion of time.
///
/// With `start_paused = true` in tests, advancing tokio time advances this
/// clock too, keeping sleeps, intervals and timestamps in agreement.
#[derive(Debug, Clone)]
pub struct TokioClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: tokio::time::Instant,
    uptime_anchor: Duration,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now(), Duration::from_secs(3600))
    }

    /// Anchor the clock at a known wall time and uptime.
    pub fn anchored_at(wall: DateTime<Utc>, uptime: Duration) -> Self {
        Self {
            wall_anchor: wall,
            instant_anchor: tokio::time::Instant::now(),
            uptime_anchor: uptime,
        }
    }

    fn elapsed(&self) -> Duration {
        tokio::time::Instant::now().saturating_duration_since(self.instant_anchor)
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_anchor + elapsed
    }

    fn uptime(&self) -> Duration {
        self.uptime_anchor + self.elapsed()
    }
}

/// Hand-driven clock.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualTime>,
}

#[derive(Debug, Clone, Copy)]
struct ManualTime {
    now: DateTime<Utc>,
    uptime: Duration,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>, uptime: Duration) -> Self {
        Self {
            inner: Mutex::new(ManualTime { now, uptime }),
        }
    }

    /// Move both wall time and uptime forward.
    pub fn advance(&self, by: Duration) {
        let mut t = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        t.now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        t.uptime += by;
    }

    /// Simulate a reboot: the device was off for `downtime` and has been up
    /// for `uptime_after` since.
    pub fn reboot(&self, downtime: Duration, uptime_after: Duration) {
        let mut t = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let gap = downtime + uptime_after;
        t.now += chrono::Duration::from_std(gap).unwrap_or_else(|_| chrono::Duration::zero());
        t.uptime = uptime_after;
    }

    /// Step the wall clock without touching uptime (NTP-style adjustment).
    pub fn adjust_wall(&self, by: chrono::Duration) {
        let mut t = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        t.now += by;
    }
}

impl Default for ManualClock {
    /// 2023-11-14T22:13:20Z, one hour after boot.
    fn default() -> Self {
        let now = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::new(now, Duration::from_secs(3600))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    fn uptime(&self) -> Duration {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).uptime
    }
}
