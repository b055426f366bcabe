use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFeedback {
    pub id: i64,
    pub task_id: Uuid,
    pub feedback_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFeedbackInput {
    pub task_id: Uuid,
    pub feedback_data: Map<String, Value>,
}
