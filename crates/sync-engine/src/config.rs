/// Engine configuration: retry policy, merge policy and coordinator options
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, SyncError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Backoff applied to each queued mutation on transport failure
    pub retry: RetryPolicy,

    /// Field-level merge policy
    pub resolver: ResolverPolicy,

    pub coordinator: CoordinatorConfig,

    /// Where actors persist their clock and queue. `None` keeps state in memory.
    pub state_dir: Option<PathBuf>,
}

impl SyncConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SyncError::Config(format!("failed to parse config: {}", e)))
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(SyncError::Config(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff with a bounded number of attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Delay before retrying after the given (1-based) attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Which fields may be merged silently by last-writer-wins.
/// Concurrent disagreements on any other field become pending conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverPolicy {
    pub silent_fields: BTreeSet<String>,
}

impl ResolverPolicy {
    /// Flag every concurrent disagreement
    pub fn strict() -> Self {
        Self {
            silent_fields: BTreeSet::new(),
        }
    }

    pub fn with_silent_field(mut self, field: impl Into<String>) -> Self {
        self.silent_fields.insert(field.into());
        self
    }
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            silent_fields: ["notes", "last_viewed_at"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Also push resolved mutations back to the actor that produced them
    pub echo_to_origin: bool,

    /// Keep every applied or discarded mutation in the store's audit archive
    pub archive: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            echo_to_origin: false,
            archive: true,
        }
    }
}
