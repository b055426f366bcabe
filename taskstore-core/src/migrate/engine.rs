use std::time::Instant;

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{info, warn};

use super::chain::{RevisionChain, Step};
use super::error::MigrationError;
use super::ledger::{self, LedgerAction, LedgerEntry};
use super::lock::{self, with_migration_lock, LockLease, LockOptions, LockState};
use super::revision::{Direction, Target};
use crate::db::Database;

/// Drives a database along a revision chain.
///
/// Every step runs in its own `BEGIN IMMEDIATE` transaction together with the
/// ledger update, so a failure leaves the ledger on the last committed step.
pub struct Migrator<'a> {
    conn: &'a mut Connection,
    chain: &'a RevisionChain,
    lock: LockOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedStep {
    pub revision: String,
    pub message: String,
    pub direction: Direction,
    pub ledger_after: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub from: Option<String>,
    pub to: Option<String>,
    pub steps: Vec<AppliedStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub revision: String,
    pub message: String,
    pub direction: Direction,
    pub ledger_after: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub parent: Option<String>,
    pub message: String,
    pub is_base: bool,
    pub is_head: bool,
    pub is_current: bool,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerStatus {
    pub current: Option<String>,
    pub head: Option<String>,
    /// Revisions between the ledger and head; `None` when the ledger is desynced.
    pub pending: Option<usize>,
    /// The ledger names a revision this build does not know.
    pub desynced: bool,
    pub lock: Option<LockState>,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a mut Database, chain: &'a RevisionChain) -> Self {
        let lock = db.lock_options().clone();
        Self {
            conn: db.connection_mut(),
            chain,
            lock,
        }
    }

    /// The underlying connection, for read-only inspection between runs.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    pub fn current(&self) -> Result<Option<String>, MigrationError> {
        ledger::ensure(self.conn)?;
        let current = ledger::read(self.conn)?;
        if let Some(id) = current.as_deref() {
            if !self.chain.contains(id) {
                warn!(
                    revision = id,
                    "ledger references a revision unknown to this build; code and database have drifted"
                );
            }
        }
        Ok(current)
    }

    pub fn heads(&self) -> Vec<String> {
        self.chain.heads().iter().map(|rev| rev.id().to_string()).collect()
    }

    pub fn status(&self) -> Result<LedgerStatus, MigrationError> {
        let current = self.current()?;
        let head = self.chain.head().map(|rev| rev.id().to_string());
        let pending = self
            .chain
            .position(current.as_deref())
            .ok()
            .map(|pos| self.chain.len() - pos);
        Ok(LedgerStatus {
            desynced: pending.is_none(),
            current,
            head,
            pending,
            lock: lock::inspect(self.conn)?,
        })
    }

    /// The chain base first, marked against the ledger.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        let current = self.current()?;
        let applied_upto = self.chain.position(current.as_deref()).unwrap_or(0);
        let head = self.chain.head().map(|rev| rev.id());

        Ok(self
            .chain
            .iter()
            .enumerate()
            .map(|(idx, rev)| HistoryEntry {
                id: rev.id().to_string(),
                parent: rev.parent().map(str::to_string),
                message: rev.message.to_string(),
                is_base: rev.is_base(),
                is_head: Some(rev.id()) == head,
                is_current: current.as_deref() == Some(rev.id()),
                applied: idx < applied_upto,
            })
            .collect())
    }

    pub fn log(&self, limit: usize) -> Result<Vec<LedgerEntry>, MigrationError> {
        ledger::ensure(self.conn)?;
        Ok(ledger::log(self.conn, limit)?)
    }

    /// What `migrate(target)` would do right now, without doing it.
    pub fn plan(&self, target: &Target) -> Result<Vec<PlannedStep>, MigrationError> {
        let current = self.current()?;
        let plan = self.chain.plan(current.as_deref(), target)?;
        Ok(plan
            .steps
            .iter()
            .map(|step| PlannedStep {
                revision: step.revision.id().to_string(),
                message: step.revision.message.to_string(),
                direction: step.direction,
                ledger_after: step.ledger_after().map(str::to_string),
            })
            .collect())
    }

    /// Move the ledger to `target` in whichever direction it lies.
    pub fn migrate(&mut self, target: &Target) -> Result<MigrationReport, MigrationError> {
        self.run(target, None)
    }

    /// Like `migrate`, but refuses a target behind the ledger.
    pub fn upgrade(&mut self, target: &Target) -> Result<MigrationReport, MigrationError> {
        self.run(target, Some(Direction::Upgrade))
    }

    /// Like `migrate`, but refuses a target ahead of the ledger.
    pub fn downgrade(&mut self, target: &Target) -> Result<MigrationReport, MigrationError> {
        self.run(target, Some(Direction::Downgrade))
    }

    /// Force the ledger to `target` without running any operation.
    ///
    /// Nothing checks that the schema actually matches afterwards.
    pub fn stamp(&mut self, target: &Target) -> Result<MigrationReport, MigrationError> {
        let chain = self.chain;
        self.precheck(target)?;

        with_migration_lock(self.conn, &self.lock, |conn, lease| {
            ledger::ensure(conn)?;
            let from = ledger::read(conn)?;
            let position = chain.resolve(target, from.as_deref())?;
            let to = chain.id_at(position).map(str::to_string);

            warn!(
                from = from.as_deref().unwrap_or("base"),
                to = to.as_deref().unwrap_or("base"),
                "STAMPING ledger without running migrations; schema may no longer match the ledger"
            );

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            lease.renew(&tx)?;
            ledger::write(&tx, to.as_deref())?;
            ledger::record(
                &tx,
                LedgerAction::Stamp,
                to.as_deref(),
                from.as_deref(),
                to.as_deref(),
            )?;
            tx.commit()?;

            Ok(MigrationReport {
                from,
                to,
                steps: Vec::new(),
            })
        })
    }

    /// Reject unknown or ambiguous targets before the lock or any
    /// transaction is touched. Relative targets need the ledger, so they are
    /// resolved under the lock instead.
    fn precheck(&self, target: &Target) -> Result<(), MigrationError> {
        if !matches!(target, Target::Relative(_)) {
            self.chain.resolve(target, None)?;
        }
        Ok(())
    }

    fn run(
        &mut self,
        target: &Target,
        required: Option<Direction>,
    ) -> Result<MigrationReport, MigrationError> {
        let chain = self.chain;
        self.precheck(target)?;

        with_migration_lock(self.conn, &self.lock, |conn, lease| {
            ledger::ensure(conn)?;
            let current = ledger::read(conn)?;
            let plan = chain.plan(current.as_deref(), target)?;

            if let (Some(required), Some(actual)) = (required, plan.direction()) {
                if required != actual {
                    return Err(MigrationError::WrongDirection {
                        requested: required,
                        target: target.to_string(),
                        current,
                    });
                }
            }

            let mut report = MigrationReport {
                from: current.clone(),
                to: current,
                steps: Vec::with_capacity(plan.steps.len()),
            };

            if plan.is_empty() {
                info!(
                    revision = report.to.as_deref().unwrap_or("base"),
                    "already at target; nothing to do"
                );
                return Ok(report);
            }

            for step in &plan.steps {
                let applied = apply_step(conn, lease, step, report.to.as_deref())?;
                report.to = applied.ledger_after.clone();
                report.steps.push(applied);
            }

            info!(
                from = report.from.as_deref().unwrap_or("base"),
                to = report.to.as_deref().unwrap_or("base"),
                steps = report.steps.len(),
                "migration complete"
            );
            Ok(report)
        })
    }
}

fn apply_step(
    conn: &mut Connection,
    lease: &LockLease,
    step: &Step<'_>,
    ledger_before: Option<&str>,
) -> Result<AppliedStep, MigrationError> {
    let revision = step.revision;
    let direction = step.direction;
    let ledger_after = step.ledger_after();
    let started = Instant::now();

    info!(
        revision = revision.id(),
        %direction,
        message = %revision.message,
        "applying revision"
    );

    let fail = |source: rusqlite::Error| MigrationError::Operation {
        revision: revision.id().to_string(),
        direction,
        ledger: ledger_before.map(str::to_string),
        source,
    };

    // Dropping `tx` on any early return rolls the step back.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(fail)?;
    tx.execute_batch(revision.sql(direction)).map_err(fail)?;

    let violations = foreign_key_violations(&tx).map_err(fail)?;
    if violations > 0 {
        return Err(MigrationError::IntegrityViolation {
            revision: revision.id().to_string(),
            direction,
            ledger: ledger_before.map(str::to_string),
            violations,
        });
    }

    lease.renew(&tx)?;
    ledger::write(&tx, ledger_after).map_err(fail)?;
    ledger::record(
        &tx,
        direction.into(),
        Some(revision.id()),
        ledger_before,
        ledger_after,
    )
    .map_err(fail)?;
    tx.commit().map_err(fail)?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        revision = revision.id(),
        %direction,
        elapsed_ms,
        "revision applied"
    );

    Ok(AppliedStep {
        revision: revision.id().to_string(),
        message: revision.message.to_string(),
        direction,
        ledger_after: ledger_after.map(str::to_string),
        elapsed_ms,
    })
}

fn foreign_key_violations(conn: &Connection) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}
