//! Database handle.
//!
//! Owns one SQLite connection with foreign keys enforced and a busy timeout
//! matching the migration lock timeout, so every wait a run can hit is
//! bounded.

pub mod schema;
mod store;

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;

use crate::config::{Config, ConfigError, DatabaseLocation};
use crate::migrate::LockOptions;

pub use schema::{
    check_head_model, snapshot, ColumnInfo, ForeignKeyInfo, IndexInfo, SchemaSnapshot, TableInfo,
    TriggerInfo,
};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid stored value in {column}: {reason}")]
    InvalidValue { column: &'static str, reason: String },
}

pub struct Database {
    conn: Connection,
    lock: LockOptions,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Self::open_with(&DatabaseLocation::File(path.as_ref().to_path_buf()), LockOptions::default())
    }

    pub fn open_memory() -> Result<Self, DatabaseError> {
        Self::open_with(&DatabaseLocation::Memory, LockOptions::default())
    }

    /// Open the database named by the environment, falling back to the
    /// platform data directory.
    pub fn open_default() -> Result<Self, DatabaseError> {
        Self::from_config(&Config::from_env()?)
    }

    pub fn from_config(config: &Config) -> Result<Self, DatabaseError> {
        Self::open_with(&config.database, config.lock.clone())
    }

    fn open_with(location: &DatabaseLocation, lock: LockOptions) -> Result<Self, DatabaseError> {
        let conn = match location {
            DatabaseLocation::Memory => Connection::open_in_memory()?,
            DatabaseLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = Connection::open(path)?;
                // Switching to WAL takes a write lock, so wait like any other writer.
                conn.busy_timeout(lock.timeout)?;
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
                conn
            }
        };

        conn.busy_timeout(lock.timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "recursive_triggers", false)?;

        Ok(Self { conn, lock })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, DatabaseError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
