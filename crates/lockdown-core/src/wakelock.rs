//! Bounded wake locks.
//!
//! Enforcement holds a wake lock while it actively drives the presentation
//! layer (redirect bursts, boot handling). [`WakeLockGuard`] releases on
//! drop, which covers `?` returns and cancelled tasks alike.

use std::sync::Arc;
use std::time::Duration;

/// Host-provided "keep the device awake" primitive.
pub trait WakeLock: Send + Sync {
    /// Hold the lock for at most `timeout`; the host releases it on its own
    /// after that even if `release` is never called.
    fn acquire(&self, tag: &str, timeout: Duration);

    fn release(&self, tag: &str);
}

/// Wake lock for hosts without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self, _tag: &str, _timeout: Duration) {}

    fn release(&self, _tag: &str) {}
}

/// Releases the wake lock when dropped.
#[must_use = "the wake lock is released as soon as the guard is dropped"]
pub struct WakeLockGuard {
    lock: Arc<dyn WakeLock>,
    tag: String,
}

impl WakeLockGuard {
    pub fn acquire(lock: Arc<dyn WakeLock>, tag: impl Into<String>, timeout: Duration) -> Self {
        let tag = tag.into();
        lock.acquire(&tag, timeout);
        tracing::trace!(tag = %tag, timeout_ms = timeout.as_millis() as u64, "wake lock acquired");
        Self { lock, tag }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.lock.release(&self.tag);
        tracing::trace!(tag = %self.tag, "wake lock released");
    }
}
