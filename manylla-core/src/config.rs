//! Sync engine configuration.

use crate::{ManyllaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for one [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub relay_url: String,
    pub poll_interval_secs: u64,
    pub push_debounce_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub offline_queue_capacity: usize,
    pub min_request_interval_ms: u64,
    pub health_check_interval_secs: u64,
    pub invite_ttl_hours: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relay_url: "https://manylla.com/qual".to_string(),
            poll_interval_secs: 60,
            push_debounce_ms: 2_000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            offline_queue_capacity: 10,
            min_request_interval_ms: 200,
            health_check_interval_secs: 30,
            invite_ttl_hours: 24,
        }
    }
}

impl SyncConfig {
    /// Read a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ManyllaError::Format(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml_dep::from_str(&content)
            .map_err(|e| ManyllaError::Format(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or spin the engine.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 7] = [
            ("relay_url", !self.relay_url.trim().is_empty()),
            ("poll_interval_secs", self.poll_interval_secs > 0),
            ("max_retries", self.max_retries > 0),
            ("offline_queue_capacity", self.offline_queue_capacity > 0),
            ("health_check_interval_secs", self.health_check_interval_secs > 0),
            ("invite_ttl_hours", self.invite_ttl_hours > 0),
            ("push_debounce_ms", self.push_debounce_ms <= 60_000),
        ];

        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(ManyllaError::Format(format!("invalid config value: {}", field))),
            None => Ok(()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn push_debounce(&self) -> Duration {
        Duration::from_millis(self.push_debounce_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn invite_ttl_ms(&self) -> i64 {
        (self.invite_ttl_hours as i64) * 60 * 60 * 1000
    }
}
