//! Run-wide migration lock.
//!
//! SQLite has no advisory locks, so the lock is a lease row claimed inside a
//! `BEGIN IMMEDIATE` transaction. A crashed run stops renewing and its lease
//! expires; a live run renews inside every step transaction, so a step only
//! commits while its run still owns the lease.
//!
//! While a step transaction is open it holds the database write lock, and a
//! waiting run cannot claim the lease however long the step takes. The lease
//! only has to cover the gap between two steps, so it defaults to less than
//! the wait timeout and a rerun after a crash takes the stale lease over.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{is_busy, MigrationError};

pub const LOCK_TABLE: &str = "schema_migration_lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// How long to wait for another run before giving up.
    pub timeout: Duration,
    /// How long a claimed lease stays valid without renewal.
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            lease: Duration::from_secs(20),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Proof that the current run owns the lock.
#[derive(Debug)]
pub struct LockLease {
    holder: String,
    lease: Duration,
}

impl LockLease {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Push the expiry forward. Run this inside the step transaction.
    pub fn renew(&self, conn: &Connection) -> Result<(), MigrationError> {
        let now = now_ms();
        let updated = conn.execute(
            "UPDATE schema_migration_lock SET expires_at_ms = ?1 WHERE id = 1 AND holder = ?2",
            params![now + lease_ms(self.lease), self.holder],
        )?;
        if updated == 0 {
            return Err(MigrationError::LockLost(self.holder.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockState {
    pub holder: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Run `f` while holding the migration lock. The lock is released whichever
/// way `f` exits, panics included; a panic is resumed after the release.
pub fn with_migration_lock<T>(
    conn: &mut Connection,
    options: &LockOptions,
    f: impl FnOnce(&mut Connection, &LockLease) -> Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    let lease = acquire(conn, options)?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *conn, &lease)));
    if let Err(err) = release(conn, &lease) {
        warn!(holder = %lease.holder, error = %err, "failed to release migration lock; it will expire");
    }
    match outcome {
        Ok(result) => result,
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// The live lease, if any run currently holds one.
pub fn inspect(conn: &Connection) -> Result<Option<LockState>, MigrationError> {
    ensure(conn)?;
    let state = conn
        .query_row(
            "SELECT holder, acquired_at_ms, expires_at_ms FROM schema_migration_lock
             WHERE id = 1 AND holder IS NOT NULL AND expires_at_ms > ?1",
            [now_ms()],
            |row| {
                Ok(LockState {
                    holder: row.get(0)?,
                    acquired_at_ms: row.get(1)?,
                    expires_at_ms: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

fn ensure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migration_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT,
            acquired_at_ms INTEGER,
            expires_at_ms INTEGER
        );
        INSERT OR IGNORE INTO schema_migration_lock (id) VALUES (1);
        "#,
    )
}

fn acquire(conn: &mut Connection, options: &LockOptions) -> Result<LockLease, MigrationError> {
    let holder = format!("pid-{}-{}", std::process::id(), Uuid::new_v4().simple());
    let started = Instant::now();

    loop {
        let blocker = match ensure(conn).and_then(|()| try_claim(conn, &holder, options.lease)) {
            Ok(None) => {
                debug!(%holder, "acquired migration lock");
                return Ok(LockLease {
                    holder,
                    lease: options.lease,
                });
            }
            Ok(Some(other)) => other,
            Err(err) if is_busy(&err) => "unknown (database busy)".to_string(),
            Err(err) => return Err(err.into()),
        };

        let waited = started.elapsed();
        if waited >= options.timeout {
            return Err(MigrationError::LockTimeout {
                holder: blocker,
                waited,
            });
        }
        debug!(%blocker, ?waited, "waiting for migration lock");
        thread::sleep(options.poll_interval.min(options.timeout - waited));
    }
}

/// `Ok(None)` when claimed, `Ok(Some(holder))` when someone else owns a live lease.
fn try_claim(conn: &mut Connection, holder: &str, lease: Duration) -> rusqlite::Result<Option<String>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_ms();

    let current: Option<(Option<String>, Option<i64>)> = tx
        .query_row(
            "SELECT holder, expires_at_ms FROM schema_migration_lock WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((Some(other), Some(expires_at))) = current {
        if expires_at > now {
            tx.commit()?;
            return Ok(Some(other));
        }
        warn!(stale_holder = %other, "taking over expired migration lock");
    }

    tx.execute(
        "UPDATE schema_migration_lock
         SET holder = ?1, acquired_at_ms = ?2, expires_at_ms = ?3
         WHERE id = 1",
        params![holder, now, now + lease_ms(lease)],
    )?;
    tx.commit()?;
    Ok(None)
}

fn release(conn: &Connection, lease: &LockLease) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE schema_migration_lock
         SET holder = NULL, acquired_at_ms = NULL, expires_at_ms = NULL
         WHERE id = 1 AND holder = ?1",
        [&lease.holder],
    )?;
    debug!(holder = %lease.holder, "released migration lock");
    Ok(())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn lease_ms(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(200),
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn lock_is_released_after_success_and_failure() {
        let mut conn = Connection::open_in_memory().unwrap();

        with_migration_lock(&mut conn, &fast(), |conn, lease| {
            let state = inspect(conn)?.expect("lock held");
            assert_eq!(state.holder, lease.holder());
            Ok(())
        })
        .unwrap();
        assert!(inspect(&conn).unwrap().is_none());

        let result: Result<(), _> = with_migration_lock(&mut conn, &fast(), |_, _| {
            Err(MigrationError::UnknownRevision("x".into()))
        });
        assert!(result.is_err());
        assert!(inspect(&conn).unwrap().is_none());
    }

    #[test]
    fn lock_is_released_when_the_closure_panics() {
        let mut conn = Connection::open_in_memory().unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), _> = with_migration_lock(&mut conn, &fast(), |_, _| panic!("step blew up"));
        }));

        assert!(outcome.is_err());
        assert!(inspect(&conn).unwrap().is_none());
        with_migration_lock(&mut conn, &fast(), |_, _| Ok(())).unwrap();
    }

    #[test]
    fn default_lease_expires_within_the_wait_timeout() {
        let options = LockOptions::default();
        assert!(options.lease < options.timeout);
    }

    #[test]
    fn live_lease_blocks_until_timeout() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure(&conn).unwrap();
        conn.execute(
            "UPDATE schema_migration_lock SET holder = 'other', acquired_at_ms = ?1, expires_at_ms = ?2",
            params![now_ms(), now_ms() + 60_000],
        )
        .unwrap();

        let err = with_migration_lock(&mut conn, &fast(), |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, MigrationError::LockTimeout { ref holder, .. } if holder == "other"));
        assert!(err.is_retryable());
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let mut conn = Connection::open_in_memory().unwrap();
        ensure(&conn).unwrap();
        conn.execute(
            "UPDATE schema_migration_lock SET holder = 'crashed', acquired_at_ms = 0, expires_at_ms = 1",
            [],
        )
        .unwrap();

        with_migration_lock(&mut conn, &fast(), |_, lease| {
            assert_ne!(lease.holder(), "crashed");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn renew_fails_once_lease_is_stolen() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = with_migration_lock(&mut conn, &fast(), |conn, lease| {
            conn.execute("UPDATE schema_migration_lock SET holder = 'thief'", [])?;
            lease.renew(conn)
        })
        .unwrap_err();
        assert!(matches!(err, MigrationError::LockLost(_)));
    }
}
