//! Repository configuration via `cairn.toml`
//!
//! On first open a default `cairn.toml` is written into the repository
//! directory. To change settings, edit the file and reopen the repository.
//! Ephemeral repositories take a `RepositoryConfig` value directly.

use cairn_core::{Error, Result};
use cairn_storage::{RetryConfig, DEFAULT_BLOCK_SHIFT, INDEX_BLOCK_SHIFT};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the repository directory.
pub const CONFIG_FILE_NAME: &str = "cairn.toml";

/// Repository configuration loaded from `cairn.toml`.
///
/// # Example
///
/// ```toml
/// block_shift = 14
/// lock_timeout_ms = 1000
/// full_text = true
/// notification_warn_ms = 50
///
/// [retry]
/// max_retries = 5
/// base_delay_ms = 5
/// max_delay_ms = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Block size of the value file store as a power of two (14 = 16 KiB, 15 = 32 KiB).
    #[serde(default = "default_block_shift")]
    pub block_shift: u8,
    /// How long a container lock may be awaited before it counts as a deadlock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Maintain the full-text index for `indexed` attributes.
    #[serde(default = "default_full_text")]
    pub full_text: bool,
    /// Listener dispatch slower than this is logged.
    #[serde(default = "default_notification_warn_ms")]
    pub notification_warn_ms: u64,
    /// Retry policy for commits aborted by container contention.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_block_shift() -> u8 {
    DEFAULT_BLOCK_SHIFT
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_full_text() -> bool {
    true
}

fn default_notification_warn_ms() -> u64 {
    50
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            block_shift: default_block_shift(),
            lock_timeout_ms: default_lock_timeout_ms(),
            full_text: default_full_text(),
            notification_warn_ms: default_notification_warn_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Set the value file block size
    pub fn with_block_shift(mut self, shift: u8) -> Self {
        self.block_shift = shift;
        self
    }

    /// Set the container lock timeout
    pub fn with_lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// Set the commit retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable the full-text index
    pub fn with_full_text(mut self, enabled: bool) -> Self {
        self.full_text = enabled;
        self
    }

    /// Set the slow-listener warning threshold
    pub fn with_notification_warn_ms(mut self, ms: u64) -> Self {
        self.notification_warn_ms = ms;
        self
    }

    /// Check values the rest of the engine relies on.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the block shift is neither 14 nor 15.
    pub fn validate(&self) -> Result<()> {
        if self.block_shift != DEFAULT_BLOCK_SHIFT && self.block_shift != INDEX_BLOCK_SHIFT {
            return Err(Error::Config(format!(
                "block_shift must be {} or {}, got {}",
                DEFAULT_BLOCK_SHIFT, INDEX_BLOCK_SHIFT, self.block_shift
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Cairn repository configuration
#
# Block size for stored files: 14 (16 KiB, default) or 15 (32 KiB)
block_shift = 14

# Milliseconds to wait for a container lock before treating it as a deadlock
lock_timeout_ms = 1000

# Maintain the full-text index for attributes marked `indexed`
full_text = true

# Log a warning when set listeners take longer than this to run
notification_warn_ms = 50

# Commit retries after deadlocks (exponential backoff, capped)
[retry]
max_retries = 5
base_delay_ms = 5
max_delay_ms = 100
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: RepositoryConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_parses_to_default() {
        let parsed: RepositoryConfig = toml::from_str(RepositoryConfig::default_toml()).unwrap();
        assert_eq!(parsed, RepositoryConfig::default());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let parsed: RepositoryConfig = toml::from_str("full_text = false").unwrap();
        assert!(!parsed.full_text);
        assert_eq!(parsed.block_shift, DEFAULT_BLOCK_SHIFT);
        assert_eq!(parsed.retry, RetryConfig::default());
    }

    #[test]
    fn test_write_default_if_missing_keeps_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        RepositoryConfig::write_default_if_missing(&path).unwrap();
        std::fs::write(&path, "block_shift = 15\n").unwrap();
        RepositoryConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(RepositoryConfig::from_file(&path).unwrap().block_shift, 15);
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = RepositoryConfig::default()
            .with_block_shift(INDEX_BLOCK_SHIFT)
            .with_retry(RetryConfig::no_retry())
            .with_notification_warn_ms(5);
        config.write_to_file(&path).unwrap();
        assert_eq!(RepositoryConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "block_shift = 20\n").unwrap();
        assert!(matches!(
            RepositoryConfig::from_file(&path),
            Err(Error::Config(_))
        ));
        std::fs::write(&path, "block_shift = \"big\"\n").unwrap();
        assert!(matches!(
            RepositoryConfig::from_file(&path),
            Err(Error::Config(_))
        ));
    }
}
