use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod chat;
pub mod protocol;
pub mod session;
pub mod store;

pub use chat::{ChatHistory, ChatMessage, ChatRole, MessageContent, NormalizedMessage};
pub use session::{canonical_session_key, SessionDescriptor};
pub use store::{StoreError, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Inbox,
    Assigned,
    InProgress,
    Review,
    Done,
    Blocked,
    Archived,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Inbox
    }
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Inbox,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
        TaskStatus::Blocked,
        TaskStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Inbox => "inbox",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "inbox" => Ok(TaskStatus::Inbox),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" | "inprogress" => Ok(TaskStatus::InProgress),
            "review" => Ok(TaskStatus::Review),
            "done" => Ok(TaskStatus::Done),
            "blocked" => Ok(TaskStatus::Blocked),
            "archived" => Ok(TaskStatus::Archived),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// A tracked unit of work, scoped to one gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub gateway_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn session_key(&self) -> Option<&str> {
        self.session_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn primary_assignee(&self) -> Option<&str> {
        self.assignee_ids
            .iter()
            .map(|id| id.trim())
            .find(|id| !id.is_empty())
    }

    /// In progress and bound to a session, so a completion watcher applies.
    pub fn is_watchable(&self) -> bool {
        self.status == TaskStatus::InProgress && self.session_key().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!("In-Progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert!("later".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let value = serde_json::to_value(TaskStatus::InProgress).expect("serialize");
        assert_eq!(value, "in_progress");
    }

    #[test]
    fn watchable_requires_progress_and_key() {
        let now = Utc::now();
        let mut task = Task {
            id: "t1".to_string(),
            gateway_id: "gw".to_string(),
            title: "Write changelog".to_string(),
            description: String::new(),
            status: TaskStatus::InProgress,
            assignee_ids: vec![" ".to_string(), "writer".to_string()],
            session_key: Some("  ".to_string()),
            run_id: None,
            source: "manual".to_string(),
            channel: None,
            spawned_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            archived_at: None,
        };
        assert_eq!(task.primary_assignee(), Some("writer"));
        assert!(!task.is_watchable());
        task.session_key = Some("agent:writer:main".to_string());
        assert!(task.is_watchable());
        task.status = TaskStatus::Review;
        assert!(!task.is_watchable());
    }
}
