//! Runtime configuration, sourced from the environment.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use tracing::debug;

use crate::migrate::LockOptions;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const LOCK_TIMEOUT_ENV: &str = "TASKSTORE_LOCK_TIMEOUT_SECS";
pub const LOCK_LEASE_ENV: &str = "TASKSTORE_LOCK_LEASE_SECS";

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    Memory,
    File(PathBuf),
}

impl DatabaseLocation {
    /// Accepts a plain path, `sqlite://<path>`, `sqlite:<path>` or `:memory:`.
    pub fn parse(url: &str) -> Self {
        let trimmed = url.trim();
        let path = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);
        match path {
            ":memory:" | "" => Self::Memory,
            _ => Self::File(PathBuf::from(path)),
        }
    }

    /// Platform data directory, e.g. `~/.local/share/taskstore/taskstore.db`.
    pub fn default_file() -> Option<Self> {
        ProjectDirs::from("", "", "taskstore")
            .map(|dirs| Self::File(dirs.data_dir().join("taskstore.db")))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseLocation,
    pub lock: LockOptions,
}

impl Config {
    pub fn new(database: DatabaseLocation) -> Self {
        Self {
            database,
            lock: LockOptions::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(None)
    }

    /// Like [`Config::from_env`], with an explicit database URL (from a CLI
    /// flag, say) taking precedence over `DATABASE_URL`.
    pub fn from_env_with(database_url: Option<&str>) -> Result<Self, ConfigError> {
        let from_env = std::env::var(DATABASE_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty());
        let database = match (database_url, from_env) {
            (Some(url), _) => DatabaseLocation::parse(url),
            (None, Some(url)) => {
                debug!("Loaded DATABASE_URL from environment");
                DatabaseLocation::parse(&url)
            }
            (None, None) => DatabaseLocation::default_file().ok_or(ConfigError::NoDataDir)?,
        };

        let mut lock = LockOptions::default();
        if let Some(secs) = secs_from_env(LOCK_TIMEOUT_ENV)? {
            lock.timeout = secs;
        }
        if let Some(secs) = secs_from_env(LOCK_LEASE_ENV)? {
            lock.lease = secs;
        }

        Ok(Self { database, lock })
    }
}

fn secs_from_env(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine a data directory; set DATABASE_URL")]
    NoDataDir,
    #[error("{name} must be a whole number of seconds, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_database_urls() {
        assert_eq!(DatabaseLocation::parse(":memory:"), DatabaseLocation::Memory);
        assert_eq!(DatabaseLocation::parse("sqlite://:memory:"), DatabaseLocation::Memory);
        assert_eq!(
            DatabaseLocation::parse("sqlite:///var/lib/tasks.db"),
            DatabaseLocation::File(PathBuf::from("/var/lib/tasks.db"))
        );
        assert_eq!(
            DatabaseLocation::parse("sqlite:tasks.db"),
            DatabaseLocation::File(PathBuf::from("tasks.db"))
        );
        assert_eq!(
            DatabaseLocation::parse("./data/tasks.db"),
            DatabaseLocation::File(PathBuf::from("./data/tasks.db"))
        );
    }

    #[test]
    fn explicit_url_wins_over_environment() {
        let config = Config::from_env_with(Some("sqlite://:memory:")).unwrap();
        assert_eq!(config.database, DatabaseLocation::Memory);
    }
}
