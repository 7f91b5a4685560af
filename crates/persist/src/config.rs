use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry behaviour for storage I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per I/O call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay_ms: u64,
    /// Deadline for a single I/O call.
    pub io_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 25,
            io_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1 << attempt.min(16)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub save_dir: PathBuf,
    pub max_backups_per_slot: usize,
    pub max_auto_save_slots: usize,
    /// Written into every save unless the caller's metadata overrides it.
    pub game_version: String,
    /// zstd level for the payload.
    pub compression_level: i32,
    pub retry: RetryPolicy,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("saves"),
            max_backups_per_slot: 3,
            max_auto_save_slots: 3,
            game_version: env!("CARGO_PKG_VERSION").to_string(),
            compression_level: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

impl PersistConfig {
    /// Defaults rooted at `save_dir`.
    pub fn in_dir(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_auto_save_slots == 0 {
            return Err(ConfigError::Invalid("max_auto_save_slots must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1"));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ConfigError::Invalid("compression_level must be within 1..=22"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PersistConfig::default();
        assert_eq!(config.max_backups_per_slot, 3);
        assert_eq!(config.max_auto_save_slots, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = PersistConfig::from_toml(
            r#"
            save_dir = "/tmp/slots"
            max_auto_save_slots = 5

            [retry]
            max_attempts = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.save_dir, PathBuf::from("/tmp/slots"));
        assert_eq!(config.max_auto_save_slots, 5);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay_ms, 25);
        assert_eq!(config.compression_level, 3);
    }

    #[test]
    fn rejects_zero_autosave_slots() {
        let err = PersistConfig::from_toml("max_auto_save_slots = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay(0), Duration::from_millis(25));
        assert_eq!(retry.delay(2), Duration::from_millis(100));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.toml");
        std::fs::write(&path, "game_version = \"2.1.0\"\n").unwrap();
        let config = PersistConfig::load(&path).unwrap();
        assert_eq!(config.game_version, "2.1.0");
        assert!(PersistConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
