//! Reversible schema migrations.
//!
//! A [`RevisionChain`] is validated up front; a [`Migrator`] then walks the
//! database along it one transaction per revision, keeping the applied
//! revision in a ledger table inside the same database.

pub mod catalog;
mod chain;
mod engine;
mod error;
pub mod ledger;
pub mod lock;
mod revision;

pub use chain::{Plan, RevisionChain, Step};
pub use engine::{AppliedStep, HistoryEntry, LedgerStatus, MigrationReport, Migrator, PlannedStep};
pub use error::{CatalogError, ChainError, MigrationError};
pub use lock::{LockOptions, LockState};
pub use revision::{Direction, Revision, Target};
