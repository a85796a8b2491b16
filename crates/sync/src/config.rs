#![forbid(unsafe_code)]

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// How the reconciler issues the row writes of one phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// One row at a time, in plan order.
    #[default]
    Sequential,
    /// All writes of a phase in flight together; the phase still completes
    /// before the next one starts.
    Concurrent,
}

impl WriteMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sequential" => Some(Self::Sequential),
            "concurrent" => Some(Self::Concurrent),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Upper bound for one `commit_reorder` / `remove_entry`; expiry rolls back.
    pub commit_timeout_ms: u64,
    pub write_mode: WriteMode,
    /// Use the gateway's atomic renumber when it offers one.
    pub prefer_atomic_batch: bool,
    /// Buffer of the list event channel; slow subscribers lag past this.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            commit_timeout_ms: DEFAULT_COMMIT_TIMEOUT_MS,
            write_mode: WriteMode::Sequential,
            prefer_atomic_batch: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl SyncConfig {
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// File (if any) first, then `WT_*` environment overrides.
    pub fn load_layered(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commit_timeout_ms == 0 {
            return Err(ConfigError::Invalid("commit_timeout_ms must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive"));
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Invalid values are logged and ignored; the previous value stays.
    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(raw) = var("WT_COMMIT_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(value) if value > 0 => self.commit_timeout_ms = value,
                _ => tracing::warn!("invalid WT_COMMIT_TIMEOUT_MS, ignoring: {raw}"),
            }
        }

        if let Some(raw) = var("WT_WRITE_MODE") {
            match WriteMode::parse(&raw) {
                Some(mode) => self.write_mode = mode,
                None => tracing::warn!("invalid WT_WRITE_MODE, ignoring: {raw}"),
            }
        }

        if let Some(raw) = var("WT_ATOMIC_RENUMBER") {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.prefer_atomic_batch = true,
                "0" | "false" | "no" => self.prefer_atomic_batch = false,
                _ => tracing::warn!("invalid WT_ATOMIC_RENUMBER, ignoring: {raw}"),
            }
        }

        if let Some(raw) = var("WT_EVENT_CAPACITY") {
            match raw.parse::<usize>() {
                Ok(value) if value > 0 => self.event_capacity = value,
                _ => tracing::warn!("invalid WT_EVENT_CAPACITY, ignoring: {raw}"),
            }
        }
    }
}
