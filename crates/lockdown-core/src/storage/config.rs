//! TOML-based engine configuration.
//!
//! Stores the tunables of the enforcement engine:
//! - Package sets (own app, allow-list, launchers, settings surfaces)
//! - Poll intervals, throttle intervals and burst windows
//! - Resilience schedule periods and boot retry offsets
//! - Lock duration bounds
//!
//! Configuration is stored at `~/.config/lockdown/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::data_dir;
use crate::error::ConfigError;

/// Package identifiers the policy distinguishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagesConfig {
    #[serde(default = "default_own_package")]
    pub own_package: String,
    #[serde(default = "default_dialer_packages")]
    pub dialer_packages: Vec<String>,
    #[serde(default = "default_sms_packages")]
    pub sms_packages: Vec<String>,
    #[serde(default = "default_launcher_packages")]
    pub launcher_packages: Vec<String>,
    /// Expected transitional foregrounds during an app switch.
    #[serde(default = "default_transient_packages")]
    pub transient_packages: Vec<String>,
    /// Surfaces that can defeat the lock; answered with a redirect burst.
    #[serde(default = "default_force_redirect_packages")]
    pub force_redirect_packages: Vec<String>,
    /// Where the user grants the overlay permission back.
    #[serde(default = "default_permission_settings_packages")]
    pub permission_settings_packages: Vec<String>,
}

/// Loop cadences, throttle intervals and windows, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_foreground_poll_ms")]
    pub foreground_poll_ms: u64,
    #[serde(default = "default_foreground_window_ms")]
    pub foreground_window_ms: u64,
    #[serde(default = "default_permission_denied_backoff_ms")]
    pub permission_denied_backoff_ms: u64,
    #[serde(default = "default_overlay_force_throttle_ms")]
    pub overlay_force_throttle_ms: u64,
    #[serde(default = "default_ui_redirect_throttle_ms")]
    pub ui_redirect_throttle_ms: u64,
    #[serde(default = "default_emergency_redirect_throttle_ms")]
    pub emergency_redirect_throttle_ms: u64,
    #[serde(default = "default_allowed_suppress_throttle_ms")]
    pub allowed_suppress_throttle_ms: u64,
    #[serde(default = "default_session_exit_confirm_ms")]
    pub session_exit_confirm_ms: u64,
    #[serde(default = "default_redirect_burst_window_ms")]
    pub redirect_burst_window_ms: u64,
    #[serde(default = "default_redirect_burst_interval_ms")]
    pub redirect_burst_interval_ms: u64,
    #[serde(default = "default_launch_ttl_ms")]
    pub launch_ttl_ms: u64,
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "default_suppression_stale_ms")]
    pub suppression_stale_ms: u64,
    #[serde(default = "default_countdown_tick_ms")]
    pub countdown_tick_ms: u64,
    #[serde(default = "default_recovery_poll_ms")]
    pub recovery_poll_ms: u64,
    #[serde(default = "default_recovery_fallback_hide_ms")]
    pub recovery_fallback_hide_ms: u64,
    #[serde(default = "default_wake_lock_max_ms")]
    pub wake_lock_max_ms: u64,
}

/// Resilience scheduling, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_heartbeat_period_secs")]
    pub heartbeat_period_secs: u64,
    #[serde(default = "default_fallback_job_period_secs")]
    pub fallback_job_period_secs: u64,
    #[serde(default = "default_process_restart_delay_secs")]
    pub process_restart_delay_secs: u64,
    #[serde(default = "default_process_restart_min_interval_secs")]
    pub process_restart_min_interval_secs: u64,
    #[serde(default = "default_boot_retry_offsets_secs")]
    pub boot_retry_offsets_secs: Vec<u64>,
    #[serde(default = "default_boot_epoch_tolerance_secs")]
    pub boot_epoch_tolerance_secs: u64,
}

/// Bounds on a requested lock window, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_min_duration_secs")]
    pub min_duration_secs: u64,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

/// Engine configuration.
///
/// Serialized to/from TOML at `~/.config/lockdown/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

// Default functions
fn default_own_package() -> String {
    "app.lockdown".into()
}
fn default_dialer_packages() -> Vec<String> {
    vec![
        "com.google.android.dialer".into(),
        "com.android.dialer".into(),
        "com.samsung.android.dialer".into(),
    ]
}
fn default_sms_packages() -> Vec<String> {
    vec![
        "com.google.android.apps.messaging".into(),
        "com.android.mms".into(),
        "com.samsung.android.messaging".into(),
    ]
}
fn default_launcher_packages() -> Vec<String> {
    vec![
        "com.google.android.apps.nexuslauncher".into(),
        "com.android.launcher3".into(),
        "com.sec.android.app.launcher".into(),
    ]
}
fn default_transient_packages() -> Vec<String> {
    vec![
        "android".into(),
        "com.android.systemui".into(),
        "com.android.permissioncontroller".into(),
        "com.google.android.permissioncontroller".into(),
    ]
}
fn default_force_redirect_packages() -> Vec<String> {
    vec![
        "com.android.settings".into(),
        "com.android.permissioncontroller".into(),
        "com.google.android.permissioncontroller".into(),
        "com.android.packageinstaller".into(),
        "com.google.android.packageinstaller".into(),
    ]
}
fn default_permission_settings_packages() -> Vec<String> {
    vec!["com.android.settings".into()]
}
fn default_foreground_poll_ms() -> u64 {
    400
}
fn default_foreground_window_ms() -> u64 {
    10_000
}
fn default_permission_denied_backoff_ms() -> u64 {
    2_000
}
fn default_overlay_force_throttle_ms() -> u64 {
    1_500
}
fn default_ui_redirect_throttle_ms() -> u64 {
    1_000
}
fn default_emergency_redirect_throttle_ms() -> u64 {
    300
}
fn default_allowed_suppress_throttle_ms() -> u64 {
    700
}
fn default_session_exit_confirm_ms() -> u64 {
    400
}
fn default_redirect_burst_window_ms() -> u64 {
    5_000
}
fn default_redirect_burst_interval_ms() -> u64 {
    400
}
fn default_launch_ttl_ms() -> u64 {
    15_000
}
fn default_session_ttl_ms() -> u64 {
    30_000
}
fn default_suppression_stale_ms() -> u64 {
    4_000
}
fn default_countdown_tick_ms() -> u64 {
    1_000
}
fn default_recovery_poll_ms() -> u64 {
    1_000
}
fn default_recovery_fallback_hide_ms() -> u64 {
    20_000
}
fn default_wake_lock_max_ms() -> u64 {
    10_000
}
fn default_heartbeat_period_secs() -> u64 {
    15 * 60
}
fn default_fallback_job_period_secs() -> u64 {
    15 * 60
}
fn default_process_restart_delay_secs() -> u64 {
    2
}
fn default_process_restart_min_interval_secs() -> u64 {
    60
}
fn default_boot_retry_offsets_secs() -> Vec<u64> {
    vec![5, 30, 90]
}
fn default_boot_epoch_tolerance_secs() -> u64 {
    10
}
fn default_min_duration_secs() -> u64 {
    60
}
fn default_max_duration_secs() -> u64 {
    30 * 24 * 60 * 60
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            own_package: default_own_package(),
            dialer_packages: default_dialer_packages(),
            sms_packages: default_sms_packages(),
            launcher_packages: default_launcher_packages(),
            transient_packages: default_transient_packages(),
            force_redirect_packages: default_force_redirect_packages(),
            permission_settings_packages: default_permission_settings_packages(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            foreground_poll_ms: default_foreground_poll_ms(),
            foreground_window_ms: default_foreground_window_ms(),
            permission_denied_backoff_ms: default_permission_denied_backoff_ms(),
            overlay_force_throttle_ms: default_overlay_force_throttle_ms(),
            ui_redirect_throttle_ms: default_ui_redirect_throttle_ms(),
            emergency_redirect_throttle_ms: default_emergency_redirect_throttle_ms(),
            allowed_suppress_throttle_ms: default_allowed_suppress_throttle_ms(),
            session_exit_confirm_ms: default_session_exit_confirm_ms(),
            redirect_burst_window_ms: default_redirect_burst_window_ms(),
            redirect_burst_interval_ms: default_redirect_burst_interval_ms(),
            launch_ttl_ms: default_launch_ttl_ms(),
            session_ttl_ms: default_session_ttl_ms(),
            suppression_stale_ms: default_suppression_stale_ms(),
            countdown_tick_ms: default_countdown_tick_ms(),
            recovery_poll_ms: default_recovery_poll_ms(),
            recovery_fallback_hide_ms: default_recovery_fallback_hide_ms(),
            wake_lock_max_ms: default_wake_lock_max_ms(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_secs: default_heartbeat_period_secs(),
            fallback_job_period_secs: default_fallback_job_period_secs(),
            process_restart_delay_secs: default_process_restart_delay_secs(),
            process_restart_min_interval_secs: default_process_restart_min_interval_secs(),
            boot_retry_offsets_secs: default_boot_retry_offsets_secs(),
            boot_epoch_tolerance_secs: default_boot_epoch_tolerance_secs(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: default_min_duration_secs(),
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

impl TimingConfig {
    pub fn foreground_poll(&self) -> Duration {
        Duration::from_millis(self.foreground_poll_ms)
    }
    pub fn foreground_window(&self) -> Duration {
        Duration::from_millis(self.foreground_window_ms)
    }
    pub fn permission_denied_backoff(&self) -> Duration {
        Duration::from_millis(self.permission_denied_backoff_ms)
    }
    pub fn session_exit_confirm(&self) -> Duration {
        Duration::from_millis(self.session_exit_confirm_ms)
    }
    pub fn redirect_burst_window(&self) -> Duration {
        Duration::from_millis(self.redirect_burst_window_ms)
    }
    pub fn redirect_burst_interval(&self) -> Duration {
        Duration::from_millis(self.redirect_burst_interval_ms)
    }
    pub fn launch_ttl(&self) -> Duration {
        Duration::from_millis(self.launch_ttl_ms)
    }
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }
    pub fn suppression_stale(&self) -> Duration {
        Duration::from_millis(self.suppression_stale_ms)
    }
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }
    pub fn recovery_poll(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_ms)
    }
    pub fn recovery_fallback_hide(&self) -> Duration {
        Duration::from_millis(self.recovery_fallback_hide_ms)
    }
    pub fn wake_lock_max(&self) -> Duration {
        Duration::from_millis(self.wake_lock_max_ms)
    }
}

impl ScheduleConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }
    pub fn fallback_job_period(&self) -> Duration {
        Duration::from_secs(self.fallback_job_period_secs)
    }
    pub fn process_restart_delay(&self) -> Duration {
        Duration::from_secs(self.process_restart_delay_secs)
    }
    pub fn boot_retry_offsets(&self) -> Vec<Duration> {
        self.boot_retry_offsets_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
    pub fn boot_epoch_tolerance(&self) -> Duration {
        Duration::from_secs(self.boot_epoch_tolerance_secs)
    }
}

impl LockConfig {
    pub fn min_duration(&self) -> Duration {
        Duration::from_secs(self.min_duration_secs)
    }
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

impl EngineConfig {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::InvalidValue {
            key: key.to_string(),
            message: "unknown config key".into(),
        };
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() || key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => serde_json::Value::Number(
                        value
                            .parse::<u64>()
                            .map_err(|e| invalid(e.to_string()))?
                            .into(),
                    ),
                    serde_json::Value::Array(_) => {
                        if value.trim_start().starts_with('[') {
                            serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                        } else {
                            // Comma-separated shorthand for package lists.
                            serde_json::Value::Array(
                                value
                                    .split(',')
                                    .map(str::trim)
                                    .filter(|s| !s.is_empty())
                                    .map(|s| serde_json::Value::String(s.to_string()))
                                    .collect(),
                            )
                        }
                    }
                    serde_json::Value::Object(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    fn path() -> Result<PathBuf, ConfigError> {
        data_dir()
            .map(|d| d.join("config.toml"))
            .map_err(|e| ConfigError::LoadFailed {
                path: PathBuf::from("config.toml"),
                message: e.to_string(),
            })
    }

    /// Load from the default location or return default.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from `path`, writing defaults there if the file is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: EngineConfig =
                    toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }

    /// Get a config value as string by dot-separated key.
    ///
    /// For host settings screens and debug tooling that edit single keys
    /// such as `timing.foreground_poll_ms` without knowing the schema.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key without persisting. The result must still
    /// validate. Hosts call [`EngineConfig::save`] once their settings
    /// screen commits, then restart the supervisor to apply it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json =
            serde_json::to_value(&*self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: EngineConfig =
            serde_json::from_value(json).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        let t = &self.timing;
        let non_zero = [
            ("timing.foreground_poll_ms", t.foreground_poll_ms),
            ("timing.overlay_force_throttle_ms", t.overlay_force_throttle_ms),
            ("timing.ui_redirect_throttle_ms", t.ui_redirect_throttle_ms),
            ("timing.emergency_redirect_throttle_ms", t.emergency_redirect_throttle_ms),
            ("timing.allowed_suppress_throttle_ms", t.allowed_suppress_throttle_ms),
            ("timing.redirect_burst_interval_ms", t.redirect_burst_interval_ms),
            ("timing.countdown_tick_ms", t.countdown_tick_ms),
            ("timing.recovery_poll_ms", t.recovery_poll_ms),
            ("schedule.heartbeat_period_secs", self.schedule.heartbeat_period_secs),
            ("schedule.fallback_job_period_secs", self.schedule.fallback_job_period_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        if t.redirect_burst_interval_ms > t.redirect_burst_window_ms {
            return Err(invalid(
                "timing.redirect_burst_interval_ms",
                "must not exceed timing.redirect_burst_window_ms",
            ));
        }
        if self.packages.own_package.is_empty() {
            return Err(invalid("packages.own_package", "must not be empty"));
        }
        if self.packages.dialer_packages.is_empty() && self.packages.sms_packages.is_empty() {
            return Err(invalid(
                "packages.dialer_packages",
                "allow-list needs at least one dialer or sms package",
            ));
        }
        if self.lock.min_duration_secs > self.lock.max_duration_secs {
            return Err(invalid(
                "lock.min_duration_secs",
                "must not exceed lock.max_duration_secs",
            ));
        }
        Ok(())
    }
}
