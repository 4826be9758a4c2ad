//! Core error types for lockdown-core.
//!
//! Every error here is recovered at the boundary where it occurs and turned
//! into a degraded-but-alive state. The one exception is
//! [`CoreError::LockStateUnknown`], raised when neither storage tier can be
//! read.

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::Tier;

/// Core error type for lockdown-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Foreground query errors
    #[error("Foreground query error: {0}")]
    Foreground(#[from] ForegroundError),

    /// Alarm scheduling errors
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    /// Presentation host errors
    #[error("Presentation error: {0}")]
    Presentation(#[from] PresentationError),

    /// Neither storage tier could be read.
    #[error("Lock state unknown: protected tier failed ({protected}), credential tier failed ({credential})")]
    LockStateUnknown {
        protected: StorageError,
        credential: StorageError,
    },

    /// A requested lock window was rejected.
    #[error("Invalid lock duration: {0}")]
    InvalidDuration(String),

    /// An allowed-app session was requested for a package that may not
    /// hold the foreground during a lock.
    #[error("Package not allowed during a lock: {0}")]
    PackageNotAllowed(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable key-value storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The tier cannot be read yet (credential storage before unlock).
    #[error("{tier} storage tier is unreachable")]
    Unreachable { tier: Tier },

    /// A stored value failed to decode.
    #[error("Corrupt value for '{key}': {message}")]
    Corrupt { key: String, message: String },

    /// Failed to open the backing file
    #[error("Failed to open storage at {path}: {message}")]
    OpenFailed { path: PathBuf, message: String },

    /// Query or transaction failed
    #[error("Storage backend failed: {0}")]
    Backend(String),

    /// Database is locked
    #[error("Storage is locked")]
    Locked,
}

/// Foreground-app query errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForegroundError {
    /// Usage-access grant is missing.
    #[error("usage access permission denied")]
    PermissionDenied,

    /// The query service failed for another reason.
    #[error("foreground query unavailable: {0}")]
    Unavailable(String),
}

/// Alarm scheduling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// Exact-alarm privilege revoked; callers fall back to inexact alarms.
    #[error("exact alarm scheduling denied")]
    ExactDenied,

    /// The scheduling backend failed.
    #[error("scheduling backend failed: {0}")]
    Backend(String),
}

/// Presentation host errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresentationError {
    /// The overlay host refused to attach (e.g. missing draw-over-apps grant).
    #[error("presentation host rejected the overlay: {0}")]
    HostRejected(String),

    /// The blocking surface is not attached.
    #[error("presentation surface is detached")]
    Detached,
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    StorageError::Locked
                } else {
                    StorageError::Backend(err.to_string())
                }
            }
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

impl StorageError {
    /// Whether this error only means "not yet readable" rather than broken.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StorageError::Unreachable { .. })
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_is_flagged() {
        let err = StorageError::Unreachable {
            tier: Tier::Credential,
        };
        assert!(err.is_unreachable());
        assert!(!StorageError::Locked.is_unreachable());
        assert_eq!(err.to_string(), "credential storage tier is unreachable");
    }

    #[test]
    fn lock_state_unknown_mentions_both_tiers() {
        let err = CoreError::LockStateUnknown {
            protected: StorageError::Backend("disk".into()),
            credential: StorageError::Unreachable {
                tier: Tier::Credential,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("protected tier failed"));
        assert!(msg.contains("credential tier failed"));
    }
}
