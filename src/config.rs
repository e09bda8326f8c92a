//! Configuration for timelock-engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("timelock-engine")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Unlock sweep interval in seconds
    #[serde(default = "default_unlock_interval")]
    pub unlock_interval_secs: u64,

    /// Ripple expansion sweep interval in seconds
    #[serde(default = "default_ripple_interval")]
    pub ripple_interval_secs: u64,

    /// Self-destruct sweep interval in seconds (low frequency)
    #[serde(default = "default_destruct_interval")]
    pub destruct_interval_secs: u64,

    /// Collision detection interval in seconds (daily)
    #[serde(default = "default_collision_interval")]
    pub collision_interval_secs: u64,

    /// Attempts at writing an unlock log entry after a won transition
    #[serde(default = "default_log_retry_attempts")]
    pub log_retry_attempts: u32,

    /// Event bus buffer size
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_unlock_interval() -> u64 {
    300
}

fn default_ripple_interval() -> u64 {
    300
}

fn default_destruct_interval() -> u64 {
    600
}

fn default_collision_interval() -> u64 {
    86_400
}

fn default_log_retry_attempts() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            unlock_interval_secs: default_unlock_interval(),
            ripple_interval_secs: default_ripple_interval(),
            destruct_interval_secs: default_destruct_interval(),
            collision_interval_secs: default_collision_interval(),
            log_retry_attempts: default_log_retry_attempts(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject intervals that would spin a worker
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("unlock_interval_secs", self.unlock_interval_secs),
            ("ripple_interval_secs", self.ripple_interval_secs),
            ("destruct_interval_secs", self.destruct_interval_secs),
            ("collision_interval_secs", self.collision_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(EngineError::Config(format!("{} must be > 0", name)));
            }
        }
        if self.log_retry_attempts == 0 {
            return Err(EngineError::Config("log_retry_attempts must be >= 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Config("event_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("timelock.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn unlock_interval(&self) -> Duration {
        Duration::from_secs(self.unlock_interval_secs)
    }

    pub fn ripple_interval(&self) -> Duration {
        Duration::from_secs(self.ripple_interval_secs)
    }

    pub fn destruct_interval(&self) -> Duration {
        Duration::from_secs(self.destruct_interval_secs)
    }

    pub fn collision_interval(&self) -> Duration {
        Duration::from_secs(self.collision_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("unlock_interval_secs = 60").unwrap();
        assert_eq!(config.unlock_interval_secs, 60);
        assert_eq!(config.ripple_interval_secs, 300);
        assert_eq!(config.collision_interval_secs, 86_400);
        assert_eq!(config.log_retry_attempts, 3);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = Config {
            unlock_interval_secs: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            destruct_interval_secs: 120,
            ..Config::default()
        };
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.destruct_interval_secs, 120);
        assert_eq!(loaded.storage_dir, dir.path());
    }
}
