use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.gaffer/config.toml`.
///
/// Every knob can also be overridden through an environment variable; see
/// [`Config::apply_env_overrides`] for the recognized set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load config from `~/.gaffer/config.toml`, falling back to defaults
    /// when the file does not exist. Environment overrides apply last.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            let text =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load from a specific path (no env overrides — useful for tests).
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply the enumerated `GAFFER_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GAFFER_DATA_DIR") {
            self.general.data_dir = Some(v);
        }
        if let Ok(v) = std::env::var("GAFFER_DB_PATH") {
            self.store.db_path = Some(v);
        }
        if let Ok(v) = std::env::var("GAFFER_LOG_DIR") {
            self.general.log_dir = Some(v);
        }
        if let Ok(v) = std::env::var("GAFFER_MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                self.scheduler.max_concurrent = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_BREAKER_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.breaker.failure_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_BREAKER_COOLDOWN_SECS") {
            if let Ok(n) = v.parse() {
                self.breaker.cooldown_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_RETRY_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.retry.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_RETRY_BASE_DELAY_MS") {
            if let Ok(n) = v.parse() {
                self.retry.base_delay_ms = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_TIMEOUT_FAST_SECS") {
            if let Ok(n) = v.parse() {
                self.scheduler.timeout_fast_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_TIMEOUT_BALANCED_SECS") {
            if let Ok(n) = v.parse() {
                self.scheduler.timeout_balanced_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_TIMEOUT_DEEP_SECS") {
            if let Ok(n) = v.parse() {
                self.scheduler.timeout_deep_secs = n;
            }
        }
        if let Ok(v) = std::env::var("GAFFER_MONITOR_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.monitor.interval_secs = n;
            }
        }
    }

    /// Root data directory: configured value, or `~/.gaffer`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.general.data_dir {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gaffer")
    }

    /// Directory holding per-task log files.
    pub fn log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.general.log_dir {
            return PathBuf::from(dir);
        }
        self.data_dir().join("tasks")
    }

    /// Path to the tasks database.
    pub fn db_path(&self) -> PathBuf {
        if let Some(p) = &self.store.db_path {
            return PathBuf::from(p);
        }
        self.data_dir().join("tasks.db")
    }

    /// Directory holding per-key circuit breaker records.
    pub fn breaker_dir(&self) -> PathBuf {
        self.data_dir().join("circuit_breakers")
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gaffer")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root data directory; defaults to `~/.gaffer`.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Per-task log directory; defaults to `<data_dir>/tasks`.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path; defaults to `<data_dir>/tasks.db`.
    #[serde(default)]
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_timeout_fast")]
    pub timeout_fast_secs: u64,
    #[serde(default = "default_timeout_balanced")]
    pub timeout_balanced_secs: u64,
    #[serde(default = "default_timeout_deep")]
    pub timeout_deep_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_fast_secs: default_timeout_fast(),
            timeout_balanced_secs: default_timeout_balanced(),
            timeout_deep_secs: default_timeout_deep(),
        }
    }
}

impl SchedulerConfig {
    /// Timeout budget for a tier, honoring config overrides.
    pub fn timeout_for(&self, tier: crate::types::ModelTier) -> std::time::Duration {
        let secs = match tier {
            crate::types::ModelTier::Fast => self.timeout_fast_secs,
            crate::types::ModelTier::Balanced => self.timeout_balanced_secs,
            crate::types::ModelTier::Deep => self.timeout_deep_secs,
        };
        std::time::Duration::from_secs(secs)
    }
}

fn default_max_concurrent() -> u32 {
    4
}
fn default_timeout_fast() -> u64 {
    600
}
fn default_timeout_balanced() -> u64 {
    1800
}
fn default_timeout_deep() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
    /// Records untouched for longer than this are swept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            half_open_successes: default_half_open_successes(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_half_open_successes() -> u32 {
    2
}
fn default_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// One of `exponential`, `linear`, `fibonacci`.
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            schedule: default_schedule(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_schedule() -> String {
    "exponential".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Bounded sample ring size (~a day at one-minute cadence).
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    #[serde(default = "default_memory_warn_pct")]
    pub memory_warn_pct: f64,
    #[serde(default = "default_disk_warn_pct")]
    pub disk_warn_pct: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            ring_capacity: default_ring_capacity(),
            memory_warn_pct: default_memory_warn_pct(),
            disk_warn_pct: default_disk_warn_pct(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    60
}
fn default_ring_capacity() -> usize {
    1_440
}
fn default_memory_warn_pct() -> f64 {
    90.0
}
fn default_disk_warn_pct() -> f64 {
    95.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
