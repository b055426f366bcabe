use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Push-notification settings persisted so long-running tasks survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub task_id: Uuid,
    pub config: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
