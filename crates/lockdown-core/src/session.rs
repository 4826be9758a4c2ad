//! Boot-fenced exception windows for the allow-listed apps.
//!
//! A session record says "the user deliberately opened the dialer (or the
//! messaging app); let it stay frontmost for a while". The record lives in
//! the protected tier so it survives a pre-unlock process restart, and it
//! carries the boot-time estimate from when it was written. Every access
//! recomputes that estimate and wipes the record when they disagree by more
//! than the tolerance: a window granted before a reboot never grants access
//! after it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::storage::{KeyValueStore, KvBatch};

const KEY_BOOT_EPOCH: &str = "boot_epoch";
const KEY_ALLOWED_PACKAGE: &str = "allowed_package";
const KEY_ALLOWED_UNTIL: &str = "allowed_until";
const KEY_LAUNCH_UNTIL: &str = "launch_until";
const KEY_SESSION_UNTIL: &str = "session_until";

const ALL_KEYS: [&str; 5] = [
    KEY_BOOT_EPOCH,
    KEY_ALLOWED_PACKAGE,
    KEY_ALLOWED_UNTIL,
    KEY_LAUNCH_UNTIL,
    KEY_SESSION_UNTIL,
];

/// Snapshot of the stored exception window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedSession {
    pub package: Option<String>,
    pub allowed_until: Option<DateTime<Utc>>,
    pub launch_until: Option<DateTime<Utc>>,
    pub session_until: Option<DateTime<Utc>>,
    pub boot_epoch: Option<DateTime<Utc>>,
}

/// Session store over the protected tier.
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    tolerance: Duration,
    guard: Mutex<()>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, tolerance: Duration) -> Self {
        Self {
            kv,
            clock,
            tolerance,
            guard: Mutex::new(()),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────

    pub fn start_launch(&self, ttl: Duration) -> Result<(), StorageError> {
        let _g = self.lock();
        self.ensure_boot_epoch_consistent()?;
        let until = self.deadline(ttl);
        self.commit_stamped(KvBatch::new().put(KEY_LAUNCH_UNTIL, until.to_string()))
    }

    pub fn start_session(&self, ttl: Duration) -> Result<(), StorageError> {
        let _g = self.lock();
        self.ensure_boot_epoch_consistent()?;
        let until = self.deadline(ttl);
        self.commit_stamped(KvBatch::new().put(KEY_SESSION_UNTIL, until.to_string()))
    }

    /// Push the session deadline to at least `now + ttl`; starts a session
    /// when none is stored.
    pub fn extend_session(&self, ttl: Duration) -> Result<(), StorageError> {
        let _g = self.lock();
        self.ensure_boot_epoch_consistent()?;
        let until = self.deadline(ttl);
        let current = self.read_ms(KEY_SESSION_UNTIL)?.unwrap_or(i64::MIN);
        if current >= until {
            return Ok(());
        }
        self.commit_stamped(KvBatch::new().put(KEY_SESSION_UNTIL, until.to_string()))
    }

    /// Remember `package` as an allowed target for `ttl`.
    pub fn set_allowed(&self, package: &str, ttl: Duration) -> Result<(), StorageError> {
        let _g = self.lock();
        self.ensure_boot_epoch_consistent()?;
        let until = self.deadline(ttl);
        self.commit_stamped(
            KvBatch::new()
                .put(KEY_ALLOWED_PACKAGE, package)
                .put(KEY_ALLOWED_UNTIL, until.to_string()),
        )
    }

    /// What an allow-list shortcut does: remember the target and open the
    /// launch window in one atomic write.
    pub fn begin_allowed_launch(
        &self,
        package: &str,
        launch_ttl: Duration,
        allowed_ttl: Duration,
    ) -> Result<(), StorageError> {
        let _g = self.lock();
        self.ensure_boot_epoch_consistent()?;
        self.commit_stamped(
            KvBatch::new()
                .put(KEY_ALLOWED_PACKAGE, package)
                .put(KEY_ALLOWED_UNTIL, self.deadline(allowed_ttl).to_string())
                .put(KEY_LAUNCH_UNTIL, self.deadline(launch_ttl).to_string()),
        )
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let _g = self.lock();
        self.wipe()
    }

    // ── Reads ────────────────────────────────────────────────────────
    //
    // Storage failures read as "not active": the lock stays enforced.

    pub fn is_launch_in_progress(&self) -> bool {
        self.deadline_active(KEY_LAUNCH_UNTIL)
    }

    pub fn is_session_active(&self) -> bool {
        self.deadline_active(KEY_SESSION_UNTIL)
    }

    pub fn is_allowed(&self, package: &str) -> bool {
        self.allowed_package().as_deref() == Some(package)
    }

    /// The remembered target while its window is open.
    pub fn allowed_package(&self) -> Option<String> {
        let _g = self.lock();
        let result: Result<Option<String>, StorageError> = (|| {
            if !self.ensure_boot_epoch_consistent()? {
                return Ok(None);
            }
            let until = self.read_ms(KEY_ALLOWED_UNTIL)?;
            if !matches!(until, Some(t) if self.clock.now_ms() < t) {
                return Ok(None);
            }
            self.kv.get(KEY_ALLOWED_PACKAGE)
        })();
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "session store read failed");
            None
        })
    }

    pub fn snapshot(&self) -> Result<AllowedSession, StorageError> {
        let _g = self.lock();
        self.ensure_boot_epoch_consistent()?;
        let at = |key: &str| -> Result<Option<DateTime<Utc>>, StorageError> {
            Ok(self
                .read_ms(key)?
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
        };
        Ok(AllowedSession {
            package: self.kv.get(KEY_ALLOWED_PACKAGE)?,
            allowed_until: at(KEY_ALLOWED_UNTIL)?,
            launch_until: at(KEY_LAUNCH_UNTIL)?,
            session_until: at(KEY_SESSION_UNTIL)?,
            boot_epoch: at(KEY_BOOT_EPOCH)?,
        })
    }

    // ── Boot fencing ─────────────────────────────────────────────────

    /// Compare the stored boot estimate with a fresh one; wipe the whole
    /// record on a mismatch beyond tolerance.
    ///
    /// Returns `false` when the record was wiped. Always checks durable
    /// storage, so a record written by a previous process is fenced too.
    /// Callers hold `guard`.
    fn ensure_boot_epoch_consistent(&self) -> Result<bool, StorageError> {
        let Some(stored) = self.read_ms(KEY_BOOT_EPOCH)? else {
            return Ok(true);
        };
        let current = self.clock.boot_epoch().timestamp_millis();
        let drift = stored.abs_diff(current);
        if u128::from(drift) <= self.tolerance.as_millis() {
            return Ok(true);
        }
        tracing::info!(stored, current, drift_ms = drift, "boot epoch changed, discarding session");
        self.wipe()?;
        Ok(false)
    }

    fn deadline_active(&self, key: &str) -> bool {
        let _g = self.lock();
        let result: Result<bool, StorageError> = (|| {
            if !self.ensure_boot_epoch_consistent()? {
                return Ok(false);
            }
            Ok(matches!(self.read_ms(key)?, Some(t) if self.clock.now_ms() < t))
        })();
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, key, "session store read failed");
            false
        })
    }

    fn wipe(&self) -> Result<(), StorageError> {
        let batch = ALL_KEYS
            .iter()
            .fold(KvBatch::new(), |batch, key| batch.remove(key));
        self.kv.commit(batch)
    }

    fn commit_stamped(&self, batch: KvBatch) -> Result<(), StorageError> {
        let epoch = self.clock.boot_epoch().timestamp_millis();
        self.kv
            .commit(batch.put(KEY_BOOT_EPOCH, epoch.to_string()))
    }

    fn deadline(&self, ttl: Duration) -> i64 {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_ms().saturating_add(ttl_ms)
    }

    fn read_ms(&self, key: &str) -> Result<Option<i64>, StorageError> {
        match self.kv.get(key)? {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|e: std::num::ParseIntError| {
                StorageError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                }
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{SqliteKv, Tier};

    const DIALER: &str = "com.android.dialer";

    fn store() -> (SessionStore, Arc<ManualClock>, Arc<SqliteKv>) {
        let kv = Arc::new(SqliteKv::open_memory(Tier::Protected).unwrap());
        let clock = Arc::new(ManualClock::default());
        let store = SessionStore::new(kv.clone(), clock.clone(), Duration::from_secs(10));
        (store, clock, kv)
    }

    #[test]
    fn session_expires_after_ttl() {
        let (s, clock, _) = store();
        s.start_session(Duration::from_secs(30)).unwrap();
        assert!(s.is_session_active());
        clock.advance(Duration::from_secs(31));
        assert!(!s.is_session_active());
    }

    #[test]
    fn extend_never_shortens() {
        let (s, clock, _) = store();
        s.start_session(Duration::from_secs(60)).unwrap();
        s.extend_session(Duration::from_secs(5)).unwrap();
        clock.advance(Duration::from_secs(30));
        assert!(s.is_session_active());
        s.extend_session(Duration::from_secs(60)).unwrap();
        clock.advance(Duration::from_secs(45));
        assert!(s.is_session_active());
    }

    #[test]
    fn allowed_package_is_remembered_until_expiry() {
        let (s, clock, _) = store();
        s.begin_allowed_launch(DIALER, Duration::from_secs(15), Duration::from_secs(30))
            .unwrap();
        assert!(s.is_launch_in_progress());
        assert!(s.is_allowed(DIALER));
        assert!(!s.is_allowed("com.other"));
        clock.advance(Duration::from_secs(16));
        assert!(!s.is_launch_in_progress());
        assert!(s.is_allowed(DIALER));
        clock.advance(Duration::from_secs(15));
        assert!(s.allowed_package().is_none());
    }

    #[test]
    fn reboot_wipes_the_record() {
        let (s, clock, kv) = store();
        s.start_session(Duration::from_secs(3600)).unwrap();
        s.set_allowed(DIALER, Duration::from_secs(3600)).unwrap();
        clock.reboot(Duration::from_secs(20), Duration::from_secs(5));

        assert!(!s.is_session_active());
        assert!(kv.get(KEY_SESSION_UNTIL).unwrap().is_none());
        assert!(kv.get(KEY_BOOT_EPOCH).unwrap().is_none());
        // Idempotent.
        assert!(!s.is_session_active());
        assert!(!s.is_allowed(DIALER));
    }

    #[test]
    fn record_written_by_previous_process_is_fenced() {
        let (s, clock, kv) = store();
        s.start_session(Duration::from_secs(3600)).unwrap();
        drop(s);
        clock.reboot(Duration::from_secs(60), Duration::from_secs(2));
        // A fresh store over the same durable tier.
        let fresh = SessionStore::new(kv.clone(), clock.clone(), Duration::from_secs(10));
        assert!(!fresh.is_session_active());
    }

    #[test]
    fn small_wall_clock_adjustment_is_tolerated() {
        let (s, clock, _) = store();
        s.start_session(Duration::from_secs(3600)).unwrap();
        clock.adjust_wall(chrono::Duration::seconds(3));
        assert!(s.is_session_active());
    }

    #[test]
    fn clear_removes_everything() {
        let (s, _, _) = store();
        s.begin_allowed_launch(DIALER, Duration::from_secs(15), Duration::from_secs(30))
            .unwrap();
        s.start_session(Duration::from_secs(30)).unwrap();
        s.clear().unwrap();
        assert_eq!(s.snapshot().unwrap(), AllowedSession::default());
    }

    #[test]
    fn corrupt_deadline_reads_as_inactive() {
        let (s, _, kv) = store();
        kv.commit(KvBatch::new().put(KEY_SESSION_UNTIL, "soon")).unwrap();
        assert!(!s.is_session_active());
    }
}
