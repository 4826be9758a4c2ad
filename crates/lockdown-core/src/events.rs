use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::presentation::PresentationMode;
use crate::scheduler::AlarmKind;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Every enforcement state change produces an Event.
/// Hosts subscribe to them for telemetry and UI refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    LockActivated {
        end: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    LockDeactivated {
        reason: DeactivationReason,
        at: DateTime<Utc>,
    },
    /// A foreground package was pushed back behind the blocking surface.
    RedirectIssued {
        package: String,
        kind: RedirectKind,
        at: DateTime<Utc>,
    },
    BurstStarted {
        package: String,
        at: DateTime<Utc>,
    },
    BurstFinished {
        package: String,
        outcome: BurstOutcome,
        redirects: u32,
        at: DateTime<Utc>,
    },
    /// An allow-listed app was confirmed in the foreground.
    SessionStarted {
        package: String,
        at: DateTime<Utc>,
    },
    SessionEnded {
        package: Option<String>,
        at: DateTime<Utc>,
    },
    ModeChanged {
        mode: PresentationMode,
        at: DateTime<Utc>,
    },
    /// Exact alarms were refused; the alarm was armed inexactly.
    SchedulingDegraded {
        kind: AlarmKind,
        reason: String,
        at: DateTime<Utc>,
    },
    PermissionDenied {
        permission: Permission,
        at: DateTime<Utc>,
    },
    CountdownExpired {
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// The lock window ran out.
    Expired,
    /// Explicit stop request.
    Stopped,
    EmergencyUnlock,
    /// Another writer cleared the stored state.
    StateCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    Overlay,
    Burst,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstOutcome {
    /// Ran for the whole window.
    Completed,
    SessionStarted,
    LockDeactivated,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    UsageAccess,
    Overlay,
    Notifications,
}

/// Broadcast fan-out for [`Event`]s. Emitting with no subscriber is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        tracing::trace!(?event, "event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
