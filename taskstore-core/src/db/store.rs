//! Row-level access to the migrated schema. Timestamps, `updated_at` and
//! `state_timestamp` are always left to the database.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Database, DatabaseError};
use crate::models::*;

const TASK_COLUMNS: &str = "id, context_id, kind, state, state_timestamp, history, artifacts, metadata, created_at, updated_at";

impl Database {
    pub fn create_context(&self, input: CreateContextInput) -> Result<Context, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO contexts (id, context_data) VALUES (?1, ?2)",
            params![id.to_string(), to_json(&input.context_data)?],
        )?;
        self.get_context(id)?
            .ok_or_else(|| missing("contexts.id", id))
    }

    pub fn get_context(&self, id: Uuid) -> Result<Option<Context>, DatabaseError> {
        self.conn
            .query_row(
                "SELECT id, context_data, message_history, created_at, updated_at
                 FROM contexts WHERE id = ?1",
                [id.to_string()],
                |row| Ok(RawContext::from_row(row)),
            )
            .optional()?
            .transpose()?
            .map(RawContext::into_context)
            .transpose()
    }

    pub fn create_task(&self, input: CreateTaskInput) -> Result<Task, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO tasks (id, context_id, kind, history, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                input.context_id.to_string(),
                input.kind.as_str(),
                to_json(&input.history)?,
                to_json(&input.metadata)?,
            ],
        )?;
        self.get_task(id)?.ok_or_else(|| missing("tasks.id", id))
    }

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        self.conn
            .query_row(&sql, [id.to_string()], |row| Ok(RawTask::from_row(row)))
            .optional()?
            .transpose()?
            .map(RawTask::into_task)
            .transpose()
    }

    pub fn list_tasks_by_context(&self, context_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE context_id = ?1 ORDER BY created_at, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map([context_id.to_string()], |row| RawTask::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawTask::into_task).collect()
    }

    /// Returns `false` when no such task exists.
    pub fn update_task_state(&self, id: Uuid, state: TaskState) -> Result<bool, DatabaseError> {
        let updated = self.conn.execute(
            "UPDATE tasks SET state = ?1 WHERE id = ?2",
            params![state.as_str(), id.to_string()],
        )?;
        Ok(updated > 0)
    }

    /// Append one message record to the task's history.
    pub fn append_task_message(&self, id: Uuid, message: &Value) -> Result<bool, DatabaseError> {
        let updated = self.conn.execute(
            "UPDATE tasks SET history = json_insert(history, '$[#]', json(?1)) WHERE id = ?2",
            params![to_json(message)?, id.to_string()],
        )?;
        Ok(updated > 0)
    }

    pub fn add_feedback(&self, input: CreateFeedbackInput) -> Result<TaskFeedback, DatabaseError> {
        self.conn.execute(
            "INSERT INTO task_feedback (task_id, feedback_data) VALUES (?1, ?2)",
            params![input.task_id.to_string(), to_json(&input.feedback_data)?],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, task_id, feedback_data, created_at FROM task_feedback WHERE id = ?1",
                [id],
                |row| Ok(RawFeedback::from_row(row)),
            )??
            .into_feedback()
    }

    pub fn list_feedback(&self, task_id: Uuid) -> Result<Vec<TaskFeedback>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, feedback_data, created_at FROM task_feedback
             WHERE task_id = ?1 ORDER BY id",
        )?;
        let raws = stmt
            .query_map([task_id.to_string()], |row| RawFeedback::from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawFeedback::into_feedback).collect()
    }

    /// Insert or replace the webhook settings for a task.
    pub fn save_webhook_config(
        &self,
        task_id: Uuid,
        config: &Map<String, Value>,
    ) -> Result<(), DatabaseError> {
        self.conn.execute(
            "INSERT INTO webhook_configs (task_id, config) VALUES (?1, ?2)
             ON CONFLICT(task_id) DO UPDATE SET config = excluded.config",
            params![task_id.to_string(), to_json(config)?],
        )?;
        Ok(())
    }

    pub fn load_webhook_config(&self, task_id: Uuid) -> Result<Option<WebhookConfig>, DatabaseError> {
        let raw = self
            .conn
            .query_row(
                "SELECT task_id, config, created_at, updated_at FROM webhook_configs WHERE task_id = ?1",
                [task_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(task_id, config, created_at, updated_at)| -> Result<_, DatabaseError> {
            Ok(WebhookConfig {
                task_id: parse_uuid("webhook_configs.task_id", &task_id)?,
                config: from_json("webhook_configs.config", &config)?,
                created_at: parse_ts("webhook_configs.created_at", &created_at)?,
                updated_at: parse_ts("webhook_configs.updated_at", &updated_at)?,
            })
        })
        .transpose()
    }

    pub fn delete_webhook_config(&self, task_id: Uuid) -> Result<(), DatabaseError> {
        self.conn.execute(
            "DELETE FROM webhook_configs WHERE task_id = ?1",
            [task_id.to_string()],
        )?;
        Ok(())
    }
}

// Rows are read as text first and decoded afterwards so decode failures
// surface as `DatabaseError::InvalidValue` with the column name.

struct RawTask {
    id: String,
    context_id: String,
    kind: String,
    state: String,
    state_timestamp: String,
    history: String,
    artifacts: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            context_id: row.get(1)?,
            kind: row.get(2)?,
            state: row.get(3)?,
            state_timestamp: row.get(4)?,
            history: row.get(5)?,
            artifacts: row.get(6)?,
            metadata: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task, DatabaseError> {
        Ok(Task {
            id: parse_uuid("tasks.id", &self.id)?,
            context_id: parse_uuid("tasks.context_id", &self.context_id)?,
            kind: TaskKind::from_str(&self.kind).ok_or_else(|| invalid("tasks.kind", &self.kind))?,
            state: TaskState::from_str(&self.state)
                .ok_or_else(|| invalid("tasks.state", &self.state))?,
            state_timestamp: parse_ts("tasks.state_timestamp", &self.state_timestamp)?,
            history: from_json("tasks.history", &self.history)?,
            artifacts: from_json("tasks.artifacts", &self.artifacts)?,
            metadata: from_json("tasks.metadata", &self.metadata)?,
            created_at: parse_ts("tasks.created_at", &self.created_at)?,
            updated_at: parse_ts("tasks.updated_at", &self.updated_at)?,
        })
    }
}

struct RawContext {
    id: String,
    context_data: String,
    message_history: String,
    created_at: String,
    updated_at: String,
}

impl RawContext {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            context_data: row.get(1)?,
            message_history: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_context(self) -> Result<Context, DatabaseError> {
        Ok(Context {
            id: parse_uuid("contexts.id", &self.id)?,
            context_data: from_json("contexts.context_data", &self.context_data)?,
            message_history: from_json("contexts.message_history", &self.message_history)?,
            created_at: parse_ts("contexts.created_at", &self.created_at)?,
            updated_at: parse_ts("contexts.updated_at", &self.updated_at)?,
        })
    }
}

struct RawFeedback {
    id: i64,
    task_id: String,
    feedback_data: String,
    created_at: String,
}

impl RawFeedback {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            feedback_data: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn into_feedback(self) -> Result<TaskFeedback, DatabaseError> {
        Ok(TaskFeedback {
            id: self.id,
            task_id: parse_uuid("task_feedback.task_id", &self.task_id)?,
            feedback_data: from_json("task_feedback.feedback_data", &self.feedback_data)?,
            created_at: parse_ts("task_feedback.created_at", &self.created_at)?,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|err| DatabaseError::InvalidValue {
        column: "json payload",
        reason: err.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(column: &'static str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|err| DatabaseError::InvalidValue {
        column,
        reason: err.to_string(),
    })
}

fn parse_uuid(column: &'static str, raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|err| DatabaseError::InvalidValue {
        column,
        reason: err.to_string(),
    })
}

fn parse_ts(column: &'static str, raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| DatabaseError::InvalidValue {
            column,
            reason: format!("{raw:?}: {err}"),
        })
}

fn invalid(column: &'static str, raw: &str) -> DatabaseError {
    DatabaseError::InvalidValue {
        column,
        reason: format!("unrecognized value {raw:?}"),
    }
}

fn missing(column: &'static str, id: Uuid) -> DatabaseError {
    DatabaseError::InvalidValue {
        column,
        reason: format!("row {id} vanished after insert"),
    }
}
