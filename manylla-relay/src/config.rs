//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    /// Request body limit in bytes.
    pub max_payload_size: usize,
    /// Longest accepted encrypted blob, in base64 characters.
    pub max_blob_size: usize,
    /// Push/pull requests per sync id per minute.
    pub rate_limit_per_minute: u32,
    /// Share creations and lookups per minute, across all clients.
    pub share_rate_limit_per_minute: u32,
    pub invite_ttl_hours: i64,
    pub max_share_expiry_hours: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8743".to_string(),
            storage_path: PathBuf::from("relay.db"),
            max_payload_size: 12 * 1024 * 1024,
            max_blob_size: 10 * 1024 * 1024,
            rate_limit_per_minute: 60,
            share_rate_limit_per_minute: 30,
            invite_ttl_hours: 24,
            max_share_expiry_hours: 30 * 24,
            cleanup_interval_secs: 3600,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_blob_size == 0 || self.max_payload_size < self.max_blob_size {
            anyhow::bail!("max_payload_size must be at least max_blob_size");
        }
        if self.rate_limit_per_minute == 0 || self.share_rate_limit_per_minute == 0 {
            anyhow::bail!("rate limits must be positive");
        }
        if self.invite_ttl_hours <= 0 || self.max_share_expiry_hours <= 0 {
            anyhow::bail!("expiry windows must be positive");
        }
        if self.cleanup_interval_secs == 0 {
            anyhow::bail!("cleanup_interval_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = \"0.0.0.0:9000\"\nrate_limit_per_minute = 10").unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.rate_limit_per_minute, 10);
        assert_eq!(config.invite_ttl_hours, 24);
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let config = RelayConfig {
            rate_limit_per_minute: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
