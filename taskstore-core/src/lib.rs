//! Core library for taskstore.
//!
//! This crate provides the persisted data model for tasks, conversation
//! contexts and task feedback, and the migration engine that moves a SQLite
//! database along the revision chain that defines that model.
//!
//! # Usage
//!
//! ```no_run
//! use taskstore_core::db::Database;
//! use taskstore_core::migrate::{catalog, Migrator, Target};
//!
//! let chain = catalog::embedded_chain()?;
//! let mut db = Database::open_default()?;
//! let report = Migrator::new(&mut db, &chain).upgrade(&Target::Head)?;
//! println!("ledger at {:?}", report.to);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod db;
pub mod migrate;
pub mod models;

// Re-export commonly used types at crate root
pub use config::Config;
pub use db::Database;
pub use migrate::{MigrationError, Migrator, RevisionChain, Target};
