//! Structural view of the live schema, and the checks the fully migrated
//! schema has to pass.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::migrate::ledger::{LEDGER_TABLE, LOG_TABLE};
use crate::migrate::lock::LOCK_TABLE;

/// Tables the head revision must provide.
pub const MODEL_TABLES: &[&str] = &["tasks", "contexts", "task_feedback", "webhook_configs"];

/// `(table, column, referenced table)`
pub const MODEL_FOREIGN_KEYS: &[(&str, &str, &str)] = &[
    ("tasks", "context_id", "contexts"),
    ("task_feedback", "task_id", "tasks"),
    ("webhook_configs", "task_id", "tasks"),
];

pub const MODEL_INDEXES: &[&str] = &[
    "idx_tasks_context_id",
    "idx_tasks_state",
    "idx_tasks_created_at",
    "idx_tasks_state_timestamp",
    "idx_tasks_metadata_skill",
    "idx_contexts_updated_at",
    "idx_task_feedback_task_id",
    "idx_task_feedback_created_at",
    "idx_task_feedback_rating",
    "idx_webhook_configs_created_at",
];

pub const MODEL_TRIGGERS: &[&str] = &[
    "trg_tasks_touch",
    "trg_contexts_touch",
    "trg_webhook_configs_touch",
    "trg_tasks_created_at_immutable",
    "trg_contexts_created_at_immutable",
    "trg_task_feedback_created_at_immutable",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableInfo>,
    pub indexes: BTreeMap<String, IndexInfo>,
    pub triggers: BTreeMap<String, TriggerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub primary_key: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    pub column: String,
    pub table: String,
    pub to: Option<String>,
    pub on_delete: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub table: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub table: String,
    pub sql: Option<String>,
}

impl SchemaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.indexes.is_empty() && self.triggers.is_empty()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    pub fn has_trigger(&self, name: &str) -> bool {
        self.triggers.contains_key(name)
    }

    pub fn has_foreign_key(&self, table: &str, column: &str, references: &str) -> bool {
        self.tables.get(table).is_some_and(|info| {
            info.foreign_keys
                .iter()
                .any(|fk| fk.column == column && fk.table == references)
        })
    }
}

/// Capture user tables, indexes and triggers.
///
/// Tables are compared by column and foreign-key metadata rather than by
/// stored DDL text, because a rebuilt-and-renamed table keeps its original
/// `CREATE` statement with a rewritten name. SQLite internals and the
/// migration bookkeeping tables are left out.
pub fn snapshot(conn: &Connection) -> rusqlite::Result<SchemaSnapshot> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, sql FROM sqlite_master
         WHERE name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
         ORDER BY type, name",
    )?;
    let objects = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut snapshot = SchemaSnapshot::default();
    for (kind, name, table, sql) in objects {
        if is_bookkeeping(&table) {
            continue;
        }
        match kind.as_str() {
            "table" => {
                let info = table_info(conn, &name)?;
                snapshot.tables.insert(name, info);
            }
            "index" => {
                snapshot.indexes.insert(name, IndexInfo { table, sql: sql.map(normalize) });
            }
            "trigger" => {
                snapshot.triggers.insert(name, TriggerInfo { table, sql: sql.map(normalize) });
            }
            _ => {}
        }
    }
    Ok(snapshot)
}

/// Everything the head schema is missing. Empty means the model holds.
pub fn check_head_model(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let snapshot = snapshot(conn)?;
    let mut problems = Vec::new();

    for table in MODEL_TABLES {
        if !snapshot.has_table(table) {
            problems.push(format!("missing table {table}"));
        }
    }
    for (table, column, references) in MODEL_FOREIGN_KEYS {
        if !snapshot.has_foreign_key(table, column, references) {
            problems.push(format!("missing foreign key {table}.{column} -> {references}"));
        }
    }
    for index in MODEL_INDEXES {
        if !snapshot.has_index(index) {
            problems.push(format!("missing index {index}"));
        }
    }
    for trigger in MODEL_TRIGGERS {
        if !snapshot.has_trigger(trigger) {
            problems.push(format!("missing trigger {trigger}"));
        }
    }

    let enforced: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    if !enforced {
        problems.push("foreign key enforcement is off for this connection".to_string());
    }

    Ok(problems)
}

fn is_bookkeeping(table: &str) -> bool {
    matches!(table, LEDGER_TABLE | LOG_TABLE | LOCK_TABLE)
}

fn table_info(conn: &Connection, table: &str) -> rusqlite::Result<TableInfo> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
        .query_map([table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                decl_type: row.get(1)?,
                not_null: row.get(2)?,
                default: row.get(3)?,
                primary_key: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT \"from\", \"table\", \"to\", on_delete FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let foreign_keys = stmt
        .query_map([table], |row| {
            Ok(ForeignKeyInfo {
                column: row.get(0)?,
                table: row.get(1)?,
                to: row.get(2)?,
                on_delete: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(TableInfo {
        columns,
        foreign_keys,
    })
}

fn normalize(sql: String) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
