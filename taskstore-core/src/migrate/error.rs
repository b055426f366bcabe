use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::revision::Direction;

/// Structural problems in the revision graph. Always reported before any
/// transaction opens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("revision {0} is declared more than once")]
    DuplicateRevision(String),
    #[error("revision {revision} builds on {parent}, which is not a known revision")]
    MissingParent { revision: String, parent: String },
    #[error("cycle detected through revision {0}")]
    CycleDetected(String),
    #[error("multiple base revisions: {}", .0.join(", "))]
    MultipleBases(Vec<String>),
    #[error("multiple head revisions: {}", .0.join(", "))]
    AmbiguousHead(Vec<String>),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("unknown revision {0}")]
    UnknownRevision(String),

    #[error("revision prefix {prefix} is ambiguous: {}", .candidates.join(", "))]
    AmbiguousRevision {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("relative target {0} moves past the end of the chain")]
    RelativeOutOfRange(String),

    #[error("ledger revision {0} is not reachable from base; code and database have drifted")]
    DisconnectedChain(String),

    #[error("{requested} to {target} is the wrong direction from {}", .current.as_deref().unwrap_or("base"))]
    WrongDirection {
        requested: Direction,
        target: String,
        current: Option<String>,
    },

    #[error("migration lock held by {holder} (waited {waited:?})")]
    LockTimeout { holder: String, waited: Duration },

    #[error("migration lock lease {0} expired and was taken over")]
    LockLost(String),

    #[error(
        "{direction} of revision {revision} failed, ledger left at {}: {source}",
        .ledger.as_deref().unwrap_or("base")
    )]
    Operation {
        revision: String,
        direction: Direction,
        ledger: Option<String>,
        #[source]
        source: rusqlite::Error,
    },

    #[error(
        "{direction} of revision {revision} left {violations} foreign key violation(s), ledger left at {}",
        .ledger.as_deref().unwrap_or("base")
    )]
    IntegrityViolation {
        revision: String,
        direction: Direction,
        ledger: Option<String>,
        violations: usize,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl MigrationError {
    /// The ledger value left behind by a failed step, when the error comes
    /// from executing one.
    pub fn ledger(&self) -> Option<Option<&str>> {
        match self {
            Self::Operation { ledger, .. } | Self::IntegrityViolation { ledger, .. } => {
                Some(ledger.as_deref())
            }
            _ => None,
        }
    }

    /// Lock contention is the only failure a caller can simply retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::Sqlite(err) | Self::Operation { source: err, .. } => is_busy(err),
            _ => false,
        }
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid revision metadata in {path}: {source}")]
    Meta {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("revision directory {0} already exists")]
    AlreadyExists(PathBuf),
}
