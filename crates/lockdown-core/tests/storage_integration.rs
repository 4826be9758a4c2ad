//! Tier reconciliation and session fencing on real database files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lockdown_core::storage::{LockConfig, SqliteKv, Tier};
use lockdown_core::{AllowedSession, LockStore, ManualClock, ReconcileOutcome, SessionStore};
use tempfile::TempDir;

const DIALER: &str = "com.google.android.dialer";

fn sessions(path: &Path, clock: &Arc<ManualClock>) -> SessionStore {
    let kv = Arc::new(SqliteKv::open(Tier::Protected, path.to_path_buf()).unwrap());
    SessionStore::new(kv, clock.clone(), Duration::from_secs(10))
}

#[test]
fn credential_tier_is_reconciled_exactly_once() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let protected = Arc::new(SqliteKv::open(Tier::Protected, dir.path().join("protected.db")).unwrap());
    let credential = Arc::new(SqliteKv::deferred(
        Tier::Credential,
        dir.path().join("credential").join("lock.db"),
    ));
    let store = LockStore::new(protected, credential.clone(), clock.clone(), LockConfig::default());
    let mut changes = store.subscribe();

    let change = store.start_lock(Duration::from_secs(600)).unwrap();
    assert!(change.protected_written);
    assert!(!change.credential_written);
    assert!(store.read_unlocked().unwrap_err().is_unreachable());
    assert!(store.read().unwrap().is_locked());

    assert_eq!(
        store.reconcile_unlocked_from_protected().unwrap(),
        ReconcileOutcome::Unreachable
    );
    credential.connect().unwrap();
    assert_eq!(store.reconcile_unlocked_from_protected().unwrap(), ReconcileOutcome::Copied);
    assert_eq!(
        store.reconcile_unlocked_from_protected().unwrap(),
        ReconcileOutcome::AlreadyInSync
    );
    assert_eq!(store.read_unlocked().unwrap(), store.read_protected().unwrap());

    assert_eq!(changes.try_recv().unwrap().seq, change.seq);
    assert!(changes.try_recv().is_err());
}

#[test]
fn lock_state_survives_reopening_both_files() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let open = || {
        LockStore::new(
            Arc::new(SqliteKv::open(Tier::Protected, dir.path().join("protected.db")).unwrap()),
            Arc::new(SqliteKv::open(Tier::Credential, dir.path().join("credential.db")).unwrap()),
            clock.clone(),
            LockConfig::default(),
        )
    };

    let written = open().start_lock(Duration::from_secs(600)).unwrap().state;
    let reopened = open();
    assert_eq!(reopened.read().unwrap(), written);
    assert!(reopened.clear_if_locked().unwrap());
    assert!(!open().read().unwrap().is_locked());
}

#[test]
fn session_window_is_fenced_by_boot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("protected.db");
    let clock = Arc::new(ManualClock::default());

    let store = sessions(&path, &clock);
    store
        .begin_allowed_launch(DIALER, Duration::from_secs(15), Duration::from_secs(30))
        .unwrap();
    drop(store);

    // Same boot, new process.
    clock.advance(Duration::from_secs(2));
    let store = sessions(&path, &clock);
    assert!(store.is_allowed(DIALER));
    assert!(store.is_launch_in_progress());

    // A small NTP step is within tolerance.
    clock.adjust_wall(chrono::Duration::seconds(5));
    assert!(store.is_allowed(DIALER));
    drop(store);

    clock.reboot(Duration::from_secs(60), Duration::from_secs(20));
    let store = sessions(&path, &clock);
    assert!(!store.is_allowed(DIALER));
    assert!(!store.is_launch_in_progress());
    assert_eq!(store.snapshot().unwrap(), AllowedSession::default());
    assert_eq!(store.snapshot().unwrap(), AllowedSession::default());
}

#[test]
fn large_wall_step_discards_the_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("protected.db");
    let clock = Arc::new(ManualClock::default());
    let store = sessions(&path, &clock);
    store.start_session(Duration::from_secs(3600)).unwrap();
    assert!(store.is_session_active());

    clock.adjust_wall(chrono::Duration::minutes(-30));
    assert!(!store.is_session_active());
    assert_eq!(store.snapshot().unwrap(), AllowedSession::default());
}
