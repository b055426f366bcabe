//! The applied-version ledger lives inside the database it describes, so a
//! revision's schema change and the ledger update commit together.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::revision::Direction;

pub const LEDGER_TABLE: &str = "schema_revision";
pub const LOG_TABLE: &str = "schema_revision_log";

const BOOTSTRAP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_revision (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    revision_id TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_revision_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL CHECK (action IN ('upgrade', 'downgrade', 'stamp')),
    revision_id TEXT,
    from_revision TEXT,
    to_revision TEXT,
    recorded_at TEXT NOT NULL
);
"#;

/// What moved the ledger.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    Upgrade,
    Downgrade,
    Stamp,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::Stamp => "stamp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "upgrade" => Some(Self::Upgrade),
            "downgrade" => Some(Self::Downgrade),
            "stamp" => Some(Self::Stamp),
            _ => None,
        }
    }
}

impl From<Direction> for LedgerAction {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Upgrade => Self::Upgrade,
            Direction::Downgrade => Self::Downgrade,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub seq: i64,
    pub action: LedgerAction,
    pub revision_id: Option<String>,
    pub from_revision: Option<String>,
    pub to_revision: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Create the ledger tables if they are missing. Safe to run concurrently.
pub fn ensure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(BOOTSTRAP_SQL)
}

/// The currently applied revision; `None` means base.
///
/// Always reads the committed row; nothing is cached between calls.
pub fn read(conn: &Connection) -> rusqlite::Result<Option<String>> {
    let row: Option<Option<String>> = conn
        .query_row(
            "SELECT revision_id FROM schema_revision WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row.flatten())
}

/// Set the ledger. Callers pass the transaction that carries the schema
/// change so both commit or neither does.
pub fn write(conn: &Connection, revision_id: Option<&str>) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO schema_revision (id, revision_id, updated_at)
        VALUES (1, ?1, ?2)
        ON CONFLICT(id) DO UPDATE SET
            revision_id = excluded.revision_id,
            updated_at = excluded.updated_at
        "#,
        params![revision_id, now_text()],
    )?;
    Ok(())
}

pub fn record(
    conn: &Connection,
    action: LedgerAction,
    revision_id: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_revision_log (action, revision_id, from_revision, to_revision, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![action.as_str(), revision_id, from, to, now_text()],
    )?;
    Ok(())
}

/// Most recent ledger movements, newest first.
pub fn log(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT seq, action, revision_id, from_revision, to_revision, recorded_at
         FROM schema_revision_log
         ORDER BY seq DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        let action: String = row.get(1)?;
        let recorded_at: String = row.get(5)?;
        Ok(LedgerEntry {
            seq: row.get(0)?,
            action: parse_action(&action, 1)?,
            revision_id: row.get(2)?,
            from_revision: row.get(3)?,
            to_revision: row.get(4)?,
            recorded_at: parse_timestamp(&recorded_at, 5)?,
        })
    })?;
    rows.collect()
}

fn parse_action(value: &str, column: usize) -> rusqlite::Result<LedgerAction> {
    LedgerAction::from_str(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            format!("unknown ledger action {value:?}").into(),
        )
    })
}

pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        ensure(&conn).unwrap();
        conn
    }

    #[test]
    fn fresh_ledger_reads_as_base() {
        let conn = conn();
        assert_eq!(read(&conn).unwrap(), None);
    }

    #[test]
    fn ensure_is_idempotent() {
        let conn = conn();
        write(&conn, Some("r1")).unwrap();
        ensure(&conn).unwrap();
        assert_eq!(read(&conn).unwrap().as_deref(), Some("r1"));
    }

    #[test]
    fn write_keeps_a_single_row() {
        let conn = conn();
        write(&conn, Some("r1")).unwrap();
        write(&conn, Some("r2")).unwrap();
        write(&conn, None).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_revision", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(read(&conn).unwrap(), None);
    }

    #[test]
    fn rolled_back_write_is_invisible() {
        let mut conn = conn();
        write(&conn, Some("r1")).unwrap();
        {
            let tx = conn.transaction().unwrap();
            write(&tx, Some("r2")).unwrap();
            // dropped without commit
        }
        assert_eq!(read(&conn).unwrap().as_deref(), Some("r1"));
    }

    #[test]
    fn log_returns_newest_first() {
        let conn = conn();
        record(&conn, LedgerAction::Upgrade, Some("r1"), None, Some("r1")).unwrap();
        record(&conn, LedgerAction::Stamp, None, Some("r1"), Some("r9")).unwrap();

        let entries = log(&conn, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, LedgerAction::Stamp);
        assert_eq!(entries[0].to_revision.as_deref(), Some("r9"));
        assert_eq!(entries[1].action, LedgerAction::Upgrade);
    }

    #[test]
    fn unknown_action_in_log_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_revision_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                revision_id TEXT,
                from_revision TEXT,
                to_revision TEXT,
                recorded_at TEXT NOT NULL
            );
            INSERT INTO schema_revision_log (action, recorded_at)
            VALUES ('merge', '2025-06-01T09:00:00.000Z');",
        )
        .unwrap();
        ensure(&conn).unwrap();

        let err = log(&conn, 10).unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(1, _, _)));
    }
}
