//! Pulse configuration system.

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PulseError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PulseConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PulseConfig {
    /// Load config from the default path (~/.pulse/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PulseError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PulseError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PulseError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Pulse home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pulse")
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.schedule_count == 0 {
            return Err(PulseError::Config("scheduler.schedule_count must be at least 1".into()));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(PulseError::Config("scheduler.tick_secs must be at least 1".into()));
        }
        if self.scheduler.timezone().is_none() {
            return Err(PulseError::Config(format!(
                "scheduler.utc_offset_minutes out of range: {}",
                self.scheduler.utc_offset_minutes
            )));
        }
        if self.credits.max_digits == 0 {
            return Err(PulseError::Config("credits.max_digits must be at least 1".into()));
        }
        if self.mail.enabled && (self.mail.smtp_host.is_empty() || self.mail.from_address.is_empty()) {
            return Err(PulseError::Config(
                "mail.smtp_host and mail.from_address are required when mail is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Batch scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum rows fetched per sweep and action type.
    #[serde(default = "default_schedule_count")]
    pub schedule_count: usize,
    /// Seconds between sweeps in daemon mode.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Server timezone used for calendar arithmetic, as minutes east of UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_schedule_count() -> usize { 100 }
fn default_tick_secs() -> u64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_count: default_schedule_count(),
            tick_secs: default_tick_secs(),
            utc_offset_minutes: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn timezone(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.pulse/pulse.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Credit validation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    /// Maximum number of digits in a rounded credit amount.
    #[serde(default = "default_max_digits")]
    pub max_digits: usize,
}

fn default_max_digits() -> usize { 8 }

impl Default for CreditsConfig {
    fn default() -> Self {
        Self { max_digits: default_max_digits() }
    }
}

/// Outbound mail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_smtp_port() -> u16 { 587 }
fn default_from_name() -> String { "Pulse".into() }

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            from_name: default_from_name(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PulseConfig::default();
        assert_eq!(config.scheduler.schedule_count, 100);
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.credits.max_digits, 8);
        assert_eq!(config.mail.smtp_port, 587);
        assert!(!config.mail.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            schedule_count = 25
            utc_offset_minutes = 330

            [database]
            path = "/tmp/pulse-test.db"

            [logging]
            level = "debug"
            json = true
        "#;

        let config: PulseConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.schedule_count, 25);
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.database.path, "/tmp/pulse-test.db");
        assert_eq!(config.scheduler.timezone().unwrap().local_minus_utc(), 330 * 60);
        assert!(config.logging.json);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: PulseConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.schedule_count, 100);
        assert_eq!(config.database.path, "~/.pulse/pulse.db");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PulseConfig::default();
        config.scheduler.schedule_count = 0;
        assert!(config.validate().is_err());

        let mut config = PulseConfig::default();
        config.scheduler.utc_offset_minutes = 24 * 60;
        assert!(config.validate().is_err());

        let mut config = PulseConfig::default();
        config.mail.enabled = true;
        assert!(config.validate().is_err());
        config.mail.smtp_host = "smtp.example.com".into();
        config.mail.from_address = "noreply@example.com".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("pulse-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = PulseConfig::default();
        config.scheduler.schedule_count = 7;
        config.save_to(&path).unwrap();
        let loaded = PulseConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.schedule_count, 7);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = PulseConfig::home_dir();
        assert!(home.to_string_lossy().contains("pulse"));
    }
}
