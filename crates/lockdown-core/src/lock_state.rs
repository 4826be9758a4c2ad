//! Persistent lock state across the two storage tiers.
//!
//! The protected tier is readable right after boot and is the source of
//! truth until the credential tier becomes reachable. From then on the
//! credential tier is authoritative, after a one-directional
//! protected → credential reconciliation.
//!
//! ## Usage
//!
//! ```ignore
//! let store = LockStore::new(protected, credential, clock, LockConfig::default());
//! let mut changes = store.subscribe();
//! store.start_lock(Duration::from_secs(3600))?;
//! // changes.recv().await yields the new state, in commit order.
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::error::{CoreError, Result, StorageError};
use crate::storage::{KeyValueStore, KvBatch, LockConfig, Tier};

const KEY_IS_LOCKED: &str = "is_locked";
const KEY_LOCK_START: &str = "lock_start";
const KEY_LOCK_END: &str = "lock_end";

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Whether the lock is active, and its window.
///
/// When `is_locked` is false both timestamps are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    is_locked: bool,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl LockState {
    pub fn unlocked() -> Self {
        Self::default()
    }

    pub fn locked(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            is_locked: true,
            start: Some(start),
            end: Some(end),
        }
    }

    /// Locked with an unknown window (e.g. a partially written record).
    pub fn locked_open_ended() -> Self {
        Self {
            is_locked: true,
            start: None,
            end: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Time left until `end`, saturating at zero. `None` without an end.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_locked {
            return None;
        }
        let end = self.end?;
        Some((end - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.end, Some(end) if self.is_locked && now >= end)
    }

    /// Enforce the cleared-together invariant and the millisecond precision
    /// the tiers store.
    fn normalized(mut self) -> Self {
        if !self.is_locked {
            self.start = None;
            self.end = None;
        }
        self.start = self.start.map(|t| t.trunc_subsecs(3));
        self.end = self.end.map(|t| t.trunc_subsecs(3));
        self
    }

    fn to_batch(self) -> KvBatch {
        let s = self.normalized();
        KvBatch::new()
            .put(KEY_IS_LOCKED, s.is_locked.to_string())
            .put_opt(KEY_LOCK_START, s.start.map(|t| t.timestamp_millis().to_string()))
            .put_opt(KEY_LOCK_END, s.end.map(|t| t.timestamp_millis().to_string()))
    }

    fn from_kv(kv: &dyn KeyValueStore) -> std::result::Result<Self, StorageError> {
        let is_locked = match kv.get(KEY_IS_LOCKED)? {
            None => false,
            Some(raw) => raw.parse::<bool>().map_err(|e| StorageError::Corrupt {
                key: KEY_IS_LOCKED.into(),
                message: e.to_string(),
            })?,
        };
        let state = Self {
            is_locked,
            start: read_millis(kv, KEY_LOCK_START)?,
            end: read_millis(kv, KEY_LOCK_END)?,
        };
        Ok(state.normalized())
    }
}

fn read_millis(
    kv: &dyn KeyValueStore,
    key: &str,
) -> std::result::Result<Option<DateTime<Utc>>, StorageError> {
    let corrupt = |message: String| StorageError::Corrupt {
        key: key.to_string(),
        message,
    };
    match kv.get(key)? {
        None => Ok(None),
        Some(raw) => {
            let ms: i64 = raw.parse().map_err(|e: std::num::ParseIntError| corrupt(e.to_string()))?;
            Utc.timestamp_millis_opt(ms)
                .single()
                .map(Some)
                .ok_or_else(|| corrupt(format!("timestamp out of range: {ms}")))
        }
    }
}

/// One physical home of the lock state.
pub trait LockStateSource: Send + Sync {
    fn tier(&self) -> Tier;

    fn is_reachable(&self) -> bool;

    fn load(&self) -> std::result::Result<LockState, StorageError>;

    /// Replace the stored state atomically.
    fn store(&self, state: &LockState) -> std::result::Result<(), StorageError>;
}

/// Lock state in the protected (direct-boot) tier.
pub struct ProtectedLockSource {
    kv: Arc<dyn KeyValueStore>,
}

impl ProtectedLockSource {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }
}

impl LockStateSource for ProtectedLockSource {
    fn tier(&self) -> Tier {
        Tier::Protected
    }

    fn is_reachable(&self) -> bool {
        self.kv.is_reachable()
    }

    fn load(&self) -> std::result::Result<LockState, StorageError> {
        LockState::from_kv(self.kv.as_ref())
    }

    fn store(&self, state: &LockState) -> std::result::Result<(), StorageError> {
        self.kv.commit(state.to_batch())
    }
}

/// Lock state in the credential tier; unreachable before credential unlock.
pub struct CredentialLockSource {
    kv: Arc<dyn KeyValueStore>,
}

impl CredentialLockSource {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn unreachable() -> StorageError {
        StorageError::Unreachable {
            tier: Tier::Credential,
        }
    }
}

impl LockStateSource for CredentialLockSource {
    fn tier(&self) -> Tier {
        Tier::Credential
    }

    fn is_reachable(&self) -> bool {
        self.kv.is_reachable()
    }

    fn load(&self) -> std::result::Result<LockState, StorageError> {
        if !self.kv.is_reachable() {
            return Err(Self::unreachable());
        }
        LockState::from_kv(self.kv.as_ref())
    }

    fn store(&self, state: &LockState) -> std::result::Result<(), StorageError> {
        if !self.kv.is_reachable() {
            return Err(Self::unreachable());
        }
        self.kv.commit(state.to_batch())
    }
}

/// A committed lock-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStateChange {
    /// Strictly increasing per store.
    pub seq: u64,
    pub state: LockState,
    /// Tiers the write landed in. A committed change always reached the
    /// protected tier.
    pub protected_written: bool,
    pub credential_written: bool,
}

/// Result of [`LockStore::reconcile_unlocked_from_protected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The credential tier differed and now mirrors the protected tier.
    Copied,
    /// Nothing to do.
    AlreadyInSync,
    /// The credential tier is still unreachable.
    Unreachable,
}

/// Both tiers plus change notification.
pub struct LockStore {
    protected: Box<dyn LockStateSource>,
    credential: Box<dyn LockStateSource>,
    /// Serializes writes; holds the last committed sequence number.
    write_seq: Mutex<u64>,
    reconciled: AtomicBool,
    changes: broadcast::Sender<LockStateChange>,
    clock: Arc<dyn Clock>,
    bounds: LockConfig,
}

impl LockStore {
    pub fn new(
        protected: Arc<dyn KeyValueStore>,
        credential: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        bounds: LockConfig,
    ) -> Self {
        Self::with_sources(
            Box::new(ProtectedLockSource::new(protected)),
            Box::new(CredentialLockSource::new(credential)),
            clock,
            bounds,
        )
    }

    pub fn with_sources(
        protected: Box<dyn LockStateSource>,
        credential: Box<dyn LockStateSource>,
        clock: Arc<dyn Clock>,
        bounds: LockConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            protected,
            credential,
            write_seq: Mutex::new(0),
            reconciled: AtomicBool::new(false),
            changes,
            clock,
            bounds,
        }
    }

    /// Changes in commit order. A lagging receiver should re-`read()`.
    pub fn subscribe(&self) -> broadcast::Receiver<LockStateChange> {
        self.changes.subscribe()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn read_protected(&self) -> std::result::Result<LockState, StorageError> {
        self.protected.load()
    }

    pub fn read_unlocked(&self) -> std::result::Result<LockState, StorageError> {
        self.credential.load()
    }

    pub fn credential_reachable(&self) -> bool {
        self.credential.is_reachable()
    }

    /// The authoritative view: credential tier once reachable (reconciling
    /// first if this store has not yet done so), protected tier otherwise.
    ///
    /// # Errors
    /// [`CoreError::LockStateUnknown`] when neither tier can be read.
    pub fn read(&self) -> Result<LockState> {
        if !self.reconciled.load(Ordering::Acquire) && self.credential.is_reachable() {
            if let Err(e) = self.reconcile_unlocked_from_protected() {
                tracing::warn!(error = %e, "lazy reconciliation failed");
            }
        }
        self.read_inner()
    }

    fn read_inner(&self) -> Result<LockState> {
        match self.credential.load() {
            Ok(state) => Ok(state),
            Err(credential) => {
                if !credential.is_unreachable() {
                    tracing::warn!(error = %credential, "credential tier read failed, using protected tier");
                }
                self.protected
                    .load()
                    .map_err(|protected| CoreError::LockStateUnknown {
                        protected,
                        credential,
                    })
            }
        }
    }

    /// Write `state` to every reachable tier and notify subscribers.
    ///
    /// The protected tier is written first and must accept the write: a
    /// failure there leaves both tiers and subscribers untouched, so a later
    /// reconcile never copies a stale protected value over a newer one. A
    /// credential failure after that is logged and healed on the next read.
    pub fn write(&self, state: LockState) -> Result<LockStateChange> {
        let mut seq = self.write_seq.lock().unwrap_or_else(|e| e.into_inner());
        self.write_locked(&mut seq, state.normalized())
    }

    fn write_locked(&self, seq: &mut u64, state: LockState) -> Result<LockStateChange> {
        if let Err(protected) = self.protected.store(&state) {
            if !self.credential.is_reachable() {
                tracing::error!(%protected, "lock state write failed with credential tier unreachable");
                return Err(CoreError::LockStateUnknown {
                    protected,
                    credential: StorageError::Unreachable {
                        tier: Tier::Credential,
                    },
                });
            }
            tracing::error!(error = %protected, "protected tier write failed, lock state unchanged");
            return Err(CoreError::Storage(protected));
        }

        let credential_written = if self.credential.is_reachable() {
            match self.credential.store(&state) {
                Ok(()) => true,
                Err(e) => {
                    if !e.is_unreachable() {
                        tracing::warn!(error = %e, "credential tier write failed");
                    }
                    false
                }
            }
        } else {
            false
        };
        // A credential tier left behind is re-synced on the next read.
        self.reconciled.store(credential_written, Ordering::Release);

        *seq += 1;
        let change = LockStateChange {
            seq: *seq,
            state,
            protected_written: true,
            credential_written,
        };
        // Sent under the write mutex so receivers observe commit order.
        let _ = self.changes.send(change);
        tracing::info!(
            seq = change.seq,
            locked = state.is_locked(),
            end = ?state.end(),
            "lock state committed"
        );
        Ok(change)
    }

    /// Copy the protected tier into the credential tier if they differ.
    ///
    /// Repeated calls after a successful copy are no-ops and emit nothing.
    pub fn reconcile_unlocked_from_protected(&self) -> Result<ReconcileOutcome> {
        let _guard = self.write_seq.lock().unwrap_or_else(|e| e.into_inner());
        if !self.credential.is_reachable() {
            return Ok(ReconcileOutcome::Unreachable);
        }
        let source = self.protected.load()?;
        let current = match self.credential.load() {
            Ok(state) => Some(state),
            Err(StorageError::Unreachable { .. }) => return Ok(ReconcileOutcome::Unreachable),
            Err(e) => {
                tracing::warn!(error = %e, "credential tier unreadable, overwriting from protected");
                None
            }
        };
        let outcome = if current == Some(source) {
            ReconcileOutcome::AlreadyInSync
        } else {
            self.credential.store(&source)?;
            tracing::info!(locked = source.is_locked(), "credential tier reconciled from protected tier");
            ReconcileOutcome::Copied
        };
        self.reconciled.store(true, Ordering::Release);
        Ok(outcome)
    }

    /// Begin a lock window of `duration` starting now.
    pub fn start_lock(&self, duration: Duration) -> Result<LockStateChange> {
        let (min, max) = (self.bounds.min_duration(), self.bounds.max_duration());
        if duration < min || duration > max {
            return Err(CoreError::InvalidDuration(format!(
                "{}s is outside [{}s, {}s]",
                duration.as_secs(),
                min.as_secs(),
                max.as_secs()
            )));
        }
        let now = self.clock.now();
        let span = chrono::Duration::from_std(duration)
            .map_err(|e| CoreError::InvalidDuration(e.to_string()))?;
        self.write(LockState::locked(now, now + span))
    }

    /// Clear the lock if it is active. Returns whether this call cleared it,
    /// so concurrent expiry paths deactivate exactly once.
    pub fn clear_if_locked(&self) -> Result<bool> {
        let mut seq = self.write_seq.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.read_inner()?;
        if !current.is_locked() {
            return Ok(false);
        }
        self.write_locked(&mut seq, LockState::unlocked())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::SqliteKv;

    /// Protected tier whose commits can be made to fail.
    struct FlakyKv {
        inner: SqliteKv,
        failing: AtomicBool,
    }

    impl KeyValueStore for FlakyKv {
        fn tier(&self) -> Tier {
            self.inner.tier()
        }

        fn is_reachable(&self) -> bool {
            self.inner.is_reachable()
        }

        fn get(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn commit(&self, batch: KvBatch) -> std::result::Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.inner.commit(batch)
        }
    }

    struct Fixture {
        protected: Arc<SqliteKv>,
        credential: Arc<SqliteKv>,
        store: LockStore,
        clock: Arc<ManualClock>,
    }

    fn fixture(credential_reachable: bool) -> Fixture {
        let protected = Arc::new(SqliteKv::open_memory(Tier::Protected).unwrap());
        let credential = Arc::new(SqliteKv::deferred_memory(Tier::Credential));
        if credential_reachable {
            credential.connect().unwrap();
        }
        let clock = Arc::new(ManualClock::default());
        let store = LockStore::new(
            protected.clone(),
            credential.clone(),
            clock.clone(),
            LockConfig::default(),
        );
        Fixture {
            protected,
            credential,
            store,
            clock,
        }
    }

    #[test]
    fn unlocked_state_never_carries_timestamps() {
        let f = fixture(true);
        f.protected
            .commit(
                KvBatch::new()
                    .put(KEY_IS_LOCKED, "false")
                    .put(KEY_LOCK_START, "1000")
                    .put(KEY_LOCK_END, "2000"),
            )
            .unwrap();
        let state = f.store.read_protected().unwrap();
        assert!(!state.is_locked());
        assert!(state.start().is_none());
        assert!(state.end().is_none());
    }

    #[test]
    fn write_lands_in_protected_only_before_unlock() {
        let f = fixture(false);
        let change = f.store.start_lock(Duration::from_secs(3600)).unwrap();
        assert!(change.protected_written);
        assert!(!change.credential_written);
        assert!(f.store.read_protected().unwrap().is_locked());
        assert!(f.store.read_unlocked().unwrap_err().is_unreachable());
        // Authoritative read falls back to protected.
        assert!(f.store.read().unwrap().is_locked());
    }

    #[test]
    fn reconcile_copies_exactly_once() {
        let f = fixture(false);
        f.store.start_lock(Duration::from_secs(3600)).unwrap();
        assert_eq!(
            f.store.reconcile_unlocked_from_protected().unwrap(),
            ReconcileOutcome::Unreachable
        );

        f.credential.connect().unwrap();
        let mut rx = f.store.subscribe();
        assert_eq!(
            f.store.reconcile_unlocked_from_protected().unwrap(),
            ReconcileOutcome::Copied
        );
        assert_eq!(
            f.store.reconcile_unlocked_from_protected().unwrap(),
            ReconcileOutcome::AlreadyInSync
        );
        assert_eq!(
            f.store.read_unlocked().unwrap(),
            f.store.read_protected().unwrap()
        );
        // Reconciliation is not a state change.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn lazy_read_reconciles_before_trusting_credential_tier() {
        let f = fixture(false);
        f.store.start_lock(Duration::from_secs(600)).unwrap();
        f.credential.connect().unwrap();
        // Credential tier is empty (unlocked) until reconciled.
        let state = f.store.read().unwrap();
        assert!(state.is_locked());
        assert!(f.store.read_unlocked().unwrap().is_locked());
    }

    #[test]
    fn subscribers_observe_commit_order() {
        let f = fixture(true);
        let mut rx = f.store.subscribe();
        f.store.start_lock(Duration::from_secs(120)).unwrap();
        f.store.clear_if_locked().unwrap();
        f.store.start_lock(Duration::from_secs(240)).unwrap();

        let seqs: Vec<(u64, bool)> = (0..3)
            .map(|_| {
                let c = rx.try_recv().unwrap();
                (c.seq, c.state.is_locked())
            })
            .collect();
        assert_eq!(seqs, vec![(1, true), (2, false), (3, true)]);
    }

    #[test]
    fn clear_if_locked_reports_only_the_first_clear() {
        let f = fixture(true);
        f.store.start_lock(Duration::from_secs(120)).unwrap();
        assert!(f.store.clear_if_locked().unwrap());
        assert!(!f.store.clear_if_locked().unwrap());
    }

    #[test]
    fn start_lock_rejects_out_of_bounds_duration() {
        let f = fixture(true);
        assert!(matches!(
            f.store.start_lock(Duration::from_secs(1)),
            Err(CoreError::InvalidDuration(_))
        ));
        assert!(!f.store.read().unwrap().is_locked());
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let f = fixture(true);
        f.store.start_lock(Duration::from_secs(90)).unwrap();
        let state = f.store.read().unwrap();
        assert_eq!(
            state.remaining(f.clock.now()),
            Some(Duration::from_secs(90))
        );
        f.clock.advance(Duration::from_secs(120));
        assert_eq!(state.remaining(f.clock.now()), Some(Duration::ZERO));
        assert!(state.is_expired(f.clock.now()));
    }

    #[test]
    fn corrupt_protected_value_is_reported() {
        let f = fixture(false);
        f.protected
            .commit(KvBatch::new().put(KEY_IS_LOCKED, "maybe"))
            .unwrap();
        assert!(matches!(
            f.store.read(),
            Err(CoreError::LockStateUnknown { .. })
        ));
    }

    #[test]
    fn failed_protected_write_leaves_the_newer_credential_state() {
        let protected = Arc::new(FlakyKv {
            inner: SqliteKv::open_memory(Tier::Protected).unwrap(),
            failing: AtomicBool::new(false),
        });
        let credential = Arc::new(SqliteKv::open_memory(Tier::Credential).unwrap());
        let clock = Arc::new(ManualClock::default());
        let open = || {
            LockStore::new(
                protected.clone(),
                credential.clone(),
                clock.clone(),
                LockConfig::default(),
            )
        };
        let store = open();
        let locked = store.start_lock(Duration::from_secs(600)).unwrap().state;
        let mut rx = store.subscribe();

        protected.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.clear_if_locked(),
            Err(CoreError::Storage(StorageError::Backend(_)))
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.read_unlocked().unwrap(), locked);
        assert_eq!(store.read_protected().unwrap(), locked);

        // A fresh store reconciling on first read keeps the lock.
        protected.failing.store(false, Ordering::SeqCst);
        let reopened = open();
        assert_eq!(reopened.read().unwrap(), locked);
        assert_eq!(reopened.read_unlocked().unwrap(), locked);
    }

    #[test]
    fn failed_protected_write_without_credential_tier_is_unknown() {
        let protected = Arc::new(FlakyKv {
            inner: SqliteKv::open_memory(Tier::Protected).unwrap(),
            failing: AtomicBool::new(true),
        });
        let credential = Arc::new(SqliteKv::deferred_memory(Tier::Credential));
        let store = LockStore::new(
            protected,
            credential,
            Arc::new(ManualClock::default()),
            LockConfig::default(),
        );
        assert!(matches!(
            store.start_lock(Duration::from_secs(600)),
            Err(CoreError::LockStateUnknown { .. })
        ));
    }
}
