pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that points directly at a config file
pub const CONFIG_ENV: &str = "INSTANCEFLOW_CONFIG";

/// Retry/backoff settings for failed reconcile passes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Daemon settings. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cloud backend name (`aws` or `fake`)
    pub provider: String,
    /// Directory holding the record store
    pub state_dir: PathBuf,
    /// Maximum number of records reconciled in parallel
    pub workers: usize,
    pub resync_interval_secs: u64,
    /// Delay between checks while waiting for an instance to start or stop
    pub poll_interval_secs: u64,
    /// Consecutive failures of one record before it is reported at error level
    pub alert_after_failures: u32,
    pub retry: RetrySettings,
    /// Default tracing filter; `RUST_LOG` overrides it
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: "aws".to_string(),
            state_dir: PathBuf::from(".instanceflow"),
            workers: 4,
            resync_interval_secs: 60,
            poll_interval_secs: 10,
            alert_after_failures: 5,
            retry: RetrySettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn validate(self) -> Result<Self> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::Invalid("resync_interval_secs must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        Ok(self)
    }
}

/// InstanceFlow's global config directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("instanceflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locate the config file
///
/// Search order:
/// 1. `INSTANCEFLOW_CONFIG` (direct path)
/// 2. `./instanceflow.yaml`
/// 3. `./.instanceflow/instanceflow.yaml`
/// 4. `~/.config/instanceflow/config.yaml` (global)
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    let path = current_dir.join("instanceflow.yaml");
    if path.exists() {
        return Ok(path);
    }

    let path = current_dir.join(".instanceflow").join("instanceflow.yaml");
    if path.exists() {
        return Ok(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("instanceflow").join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// Parse settings from a specific file
pub fn load_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = if content.trim().is_empty() {
        Settings::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    tracing::debug!(path = %path.display(), "loaded config");
    settings.validate()
}

/// Locate and parse the config file, falling back to defaults when none exists
pub fn load() -> Result<Settings> {
    match find_config_file() {
        Ok(path) => load_from(&path),
        Err(ConfigError::ConfigFileNotFound) => Ok(Settings::default()),
        Err(e) => Err(e),
    }
}
