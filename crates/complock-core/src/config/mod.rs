//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::locking::LockConfig;
use crate::domain::session::{MAX_USER_ID_LEN, SessionContext};
use crate::storage::{DatabaseConfig, default_database_path};

/// Longest accepted lease timeout (one year)
pub const MAX_LEASE_TIMEOUT_MINUTES: u64 = 365 * 24 * 60;

/// Complock configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Age after which another session may reclaim a lease
    pub lease_timeout_minutes: u64,
    pub event_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Lease database file; the platform data dir when unset
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    /// Lease acquisitions allowed in flight at once
    pub max_lease_connections: usize,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// User recorded in leases; `USER`/`USERNAME` when unset
    pub user_id: Option<String>,
}

impl Default for LockSettings {
    fn default() -> Self {
        let defaults = LockConfig::default();
        Self {
            lease_timeout_minutes: defaults.lease_timeout.as_secs() / 60,
            event_capacity: defaults.event_capacity,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            path: None,
            max_connections: defaults.max_connections,
            max_lease_connections: defaults.max_lease_connections,
            busy_timeout_ms: defaults.busy_timeout.as_millis() as u64,
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("COMPLOCK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("complock")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        check_lease_timeout(self.lock.lease_timeout_minutes)?;
        if self.lock.event_capacity == 0 {
            return Err(anyhow!("lock.event_capacity must be at least 1"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow!("database.max_connections must be at least 1"));
        }
        if self.database.max_lease_connections == 0 {
            return Err(anyhow!("database.max_lease_connections must be at least 1"));
        }
        if let Some(user) = &self.session.user_id {
            if user.is_empty() || user.chars().count() > MAX_USER_ID_LEN {
                return Err(anyhow!(
                    "session.user_id must be 1 to {} characters",
                    MAX_USER_ID_LEN
                ));
            }
        }
        Ok(())
    }

    /// Lock manager settings
    pub fn to_lock_config(&self) -> LockConfig {
        let minutes = self.lock.lease_timeout_minutes.min(MAX_LEASE_TIMEOUT_MINUTES);
        LockConfig::default()
            .with_lease_timeout(Duration::from_secs(minutes.saturating_mul(60)))
            .with_event_capacity(self.lock.event_capacity)
    }

    /// Lease database settings
    pub fn to_database_config(&self) -> DatabaseConfig {
        let path = self
            .database
            .path
            .clone()
            .unwrap_or_else(default_database_path);
        DatabaseConfig::with_path(path)
            .max_connections(self.database.max_connections)
            .max_lease_connections(self.database.max_lease_connections)
            .busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
    }

    /// Start a session for the configured user
    pub fn to_session(&self) -> crate::Result<SessionContext> {
        match &self.session.user_id {
            Some(user) => SessionContext::new(user.clone()),
            None => SessionContext::from_env(),
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            // Lock settings
            "lock.lease_timeout_minutes" => Ok(self.lock.lease_timeout_minutes.to_string()),
            "lock.event_capacity" => Ok(self.lock.event_capacity.to_string()),

            // Database settings
            "database.path" => Ok(self
                .database
                .path
                .clone()
                .unwrap_or_else(default_database_path)
                .display()
                .to_string()),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),
            "database.max_lease_connections" => Ok(self.database.max_lease_connections.to_string()),
            "database.busy_timeout_ms" => Ok(self.database.busy_timeout_ms.to_string()),

            // Session settings
            "session.user_id" => Ok(self
                .session
                .user_id
                .clone()
                .unwrap_or_else(|| "(not set - uses USER or USERNAME env var)".to_string())),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `complock config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            // Lock settings
            "lock.lease_timeout_minutes" => {
                let minutes: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid lease_timeout_minutes value: {}", value))?;
                check_lease_timeout(minutes)?;
                self.lock.lease_timeout_minutes = minutes;
            }
            "lock.event_capacity" => {
                self.lock.event_capacity = parse_positive(key, value)?;
            }

            // Database settings
            "database.path" => {
                self.database.path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "database.max_connections" => {
                self.database.max_connections = parse_positive(key, value)?;
            }
            "database.max_lease_connections" => {
                self.database.max_lease_connections = parse_positive(key, value)?;
            }
            "database.busy_timeout_ms" => {
                self.database.busy_timeout_ms = value
                    .parse()
                    .with_context(|| format!("Invalid busy_timeout_ms value: {}", value))?;
            }

            // Session settings
            "session.user_id" => {
                if value.chars().count() > MAX_USER_ID_LEN {
                    return Err(anyhow!(
                        "User id must be at most {} characters",
                        MAX_USER_ID_LEN
                    ));
                }
                self.session.user_id = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `complock config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = vec![
            "lock.lease_timeout_minutes",
            "lock.event_capacity",
            "database.path",
            "database.max_connections",
            "database.max_lease_connections",
            "database.busy_timeout_ms",
            "session.user_id",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn check_lease_timeout(minutes: u64) -> anyhow::Result<()> {
    if minutes == 0 || minutes > MAX_LEASE_TIMEOUT_MINUTES {
        return Err(anyhow!(
            "lock.lease_timeout_minutes must be between 1 and {}",
            MAX_LEASE_TIMEOUT_MINUTES
        ));
    }
    Ok(())
}

fn parse_positive<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let parsed: T = value
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", key, value))?;
    if parsed <= T::default() {
        return Err(anyhow!("{} must be at least 1", key));
    }
    Ok(parsed)
}
