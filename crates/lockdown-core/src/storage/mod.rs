mod config;
pub mod kv;

pub use config::{EngineConfig, LockConfig, PackagesConfig, ScheduleConfig, TimingConfig};
pub use kv::{KeyValueStore, KvBatch, KvOp, SqliteKv};

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Physical storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Readable before credential unlock (direct boot); survives reboot.
    Protected,
    /// Readable only after the user unlocks their credential.
    Credential,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Protected => f.write_str("protected"),
            Tier::Credential => f.write_str("credential"),
        }
    }
}

/// Returns `~/.config/lockdown[-dev]/` based on LOCKDOWN_ENV.
///
/// Set LOCKDOWN_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> std::io::Result<PathBuf> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("LOCKDOWN_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("lockdown-dev")
    } else {
        base_dir.join("lockdown")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// On-disk locations of the two tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub protected: PathBuf,
    pub credential: PathBuf,
}

impl StoragePaths {
    /// Default layout under [`data_dir`]. Hosts with a real device-protected
    /// area supply their own paths instead.
    pub fn default_layout() -> std::io::Result<Self> {
        let dir = data_dir()?;
        Ok(Self {
            protected: dir.join("protected.db"),
            credential: dir.join("credential").join("lock.db"),
        })
    }
}
