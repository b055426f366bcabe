use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub context_id: Uuid,
    pub kind: TaskKind,
    pub state: TaskState,
    pub state_timestamp: DateTime<Utc>,
    pub history: Vec<Value>,
    pub artifacts: Vec<Value>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle position of a task, using the protocol's hyphenated names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
    Rejected,
    AuthRequired,
    Unknown,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::AuthRequired => "auth-required",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "working" => Some(Self::Working),
            "input-required" => Some(Self::InputRequired),
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            "auth-required" => Some(Self::AuthRequired),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Task,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskInput {
    pub context_id: Uuid,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub history: Vec<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip_through_as_str() {
        for state in [
            TaskState::Submitted,
            TaskState::Working,
            TaskState::InputRequired,
            TaskState::Completed,
            TaskState::Canceled,
            TaskState::Failed,
            TaskState::Rejected,
            TaskState::AuthRequired,
            TaskState::Unknown,
        ] {
            assert_eq!(TaskState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::from_str("done"), None);
    }

    #[test]
    fn serde_uses_hyphenated_state_names() {
        let json = serde_json::to_string(&TaskState::InputRequired).unwrap();
        assert_eq!(json, "\"input-required\"");
    }
}
