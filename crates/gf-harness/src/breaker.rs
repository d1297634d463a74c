//! Per-key circuit breaker with persisted state.
//!
//! Each key (e.g. `"agent.invoke"`) owns a small JSON file under the breaker
//! directory, replaced atomically on every state change so a restart resumes
//! in the same regime. [`CircuitBreaker::sweep_stale`] MUST be driven by a
//! periodic maintenance timer — records otherwise accumulate on disk forever.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub cooldown: Duration,
    /// Consecutive half-open successes required to close.
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_successes: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// State + record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation — calls pass through.
    Closed,
    /// Too many failures — calls are suppressed.
    Open,
    /// Testing recovery — a single probe is allowed.
    HalfOpen,
}

/// The persisted per-key record. Round-trips bitwise-equal through its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub key: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub half_open_successes: u32,
    pub updated_at: DateTime<Utc>,
    /// A half-open probe call is currently executing. Runtime-only: not
    /// persisted, so a restart (which also killed the probe) clears it.
    #[serde(skip)]
    pub probe_in_flight: bool,
}

impl BreakerRecord {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            half_open_successes: 0,
            updated_at: Utc::now(),
            probe_in_flight: false,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Keyed circuit breaker backed by one JSON file per key.
pub struct CircuitBreaker {
    config: BreakerConfig,
    dir: PathBuf,
    records: Mutex<HashMap<String, BreakerRecord>>,
}

impl CircuitBreaker {
    pub fn new(dir: impl Into<PathBuf>, config: BreakerConfig) -> Self {
        Self {
            config,
            dir: dir.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call keyed by `key` may proceed right now.
    ///
    /// An open breaker whose cooldown has elapsed transitions to half-open
    /// here. Half-open admits exactly one probe at a time: the first caller
    /// raises the in-flight flag and is admitted; everyone else is rejected
    /// until `record_success`/`record_failure` settles the probe.
    pub async fn should_attempt(&self, key: &str) -> Result<bool, BreakerError> {
        let mut records = self.records.lock().await;
        let record = self.entry(&mut records, key)?;
        match record.state {
            BreakerState::Closed => Ok(true),
            BreakerState::HalfOpen => {
                if record.probe_in_flight {
                    return Ok(false);
                }
                record.probe_in_flight = true;
                record.updated_at = Utc::now();
                self.persist(record)?;
                Ok(true)
            }
            BreakerState::Open => {
                let due = record
                    .next_probe_at
                    .map(|at| Utc::now() >= at)
                    .unwrap_or(true);
                if due {
                    info!(key, "circuit breaker transitioning open -> half_open");
                    record.state = BreakerState::HalfOpen;
                    record.half_open_successes = 0;
                    record.probe_in_flight = true;
                    record.updated_at = Utc::now();
                    self.persist(record)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Record a successful call on `key`.
    pub async fn record_success(&self, key: &str) -> Result<(), BreakerError> {
        let mut records = self.records.lock().await;
        let threshold = self.config.half_open_successes;
        let record = self.entry(&mut records, key)?;
        record.probe_in_flight = false;
        match record.state {
            BreakerState::HalfOpen => {
                record.half_open_successes += 1;
                if record.half_open_successes >= threshold {
                    info!(key, "circuit breaker transitioning half_open -> closed");
                    record.state = BreakerState::Closed;
                    record.consecutive_failures = 0;
                    record.half_open_successes = 0;
                    record.opened_at = None;
                    record.next_probe_at = None;
                }
            }
            BreakerState::Closed => {
                record.consecutive_failures = 0;
            }
            BreakerState::Open => {}
        }
        record.updated_at = Utc::now();
        self.persist(record)
    }

    /// Record a failed call on `key`.
    pub async fn record_failure(&self, key: &str) -> Result<(), BreakerError> {
        let mut records = self.records.lock().await;
        let threshold = self.config.failure_threshold;
        let cooldown = self.config.cooldown;
        let record = self.entry(&mut records, key)?;
        record.probe_in_flight = false;
        record.consecutive_failures += 1;
        match record.state {
            BreakerState::Closed => {
                if record.consecutive_failures >= threshold {
                    warn!(
                        key,
                        failures = record.consecutive_failures,
                        "circuit breaker transitioning closed -> open"
                    );
                    open_record(record, cooldown);
                }
            }
            BreakerState::HalfOpen => {
                warn!(key, "probe failed; circuit breaker reopening");
                open_record(record, cooldown);
            }
            BreakerState::Open => {}
        }
        record.updated_at = Utc::now();
        self.persist(record)
    }

    /// Current state for `key` (loading from disk if needed).
    pub async fn state(&self, key: &str) -> Result<BreakerState, BreakerError> {
        let mut records = self.records.lock().await;
        Ok(self.entry(&mut records, key)?.state)
    }

    /// Snapshot of the persisted record for `key`.
    pub async fn record(&self, key: &str) -> Result<BreakerRecord, BreakerError> {
        let mut records = self.records.lock().await;
        Ok(self.entry(&mut records, key)?.clone())
    }

    /// Remove on-disk records untouched for longer than `retention`.
    /// Returns the number of records removed.
    pub async fn sweep_stale(&self, retention: Duration) -> Result<usize, BreakerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7));
        let mut removed = 0;
        let mut records = self.records.lock().await;

        if !self.dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<BreakerRecord>(&text) else {
                // Unreadable records count as stale.
                std::fs::remove_file(&path)?;
                removed += 1;
                continue;
            };
            if record.updated_at < cutoff {
                std::fs::remove_file(&path)?;
                records.remove(&record.key);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept stale circuit breaker records");
        }
        Ok(removed)
    }

    // ----- helpers -----

    /// Fetch the in-memory record for `key`, loading the persisted file on
    /// first access.
    fn entry<'a>(
        &self,
        records: &'a mut HashMap<String, BreakerRecord>,
        key: &str,
    ) -> Result<&'a mut BreakerRecord, BreakerError> {
        if !records.contains_key(key) {
            let loaded = self.load(key)?.unwrap_or_else(|| BreakerRecord::new(key));
            records.insert(key.to_string(), loaded);
        }
        Ok(records.get_mut(key).expect("record just inserted"))
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn load(&self, key: &str) -> Result<Option<BreakerRecord>, BreakerError> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write the record to its file with atomic replace.
    fn persist(&self, record: &BreakerRecord) -> Result<(), BreakerError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn open_record(record: &mut BreakerRecord, cooldown: Duration) {
    let now = Utc::now();
    record.state = BreakerState::Open;
    record.half_open_successes = 0;
    record.opened_at = Some(now);
    record.next_probe_at =
        Some(now + chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::seconds(60)));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
