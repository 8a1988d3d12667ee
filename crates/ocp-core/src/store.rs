//! Persistence seam for tasks and their audit trail.
//!
//! Every operation is scoped by gateway id. The store is authoritative for
//! session-key uniqueness: `create_task` with a key that is already bound
//! returns the existing task id instead of inserting a second row.

use crate::{Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_COMMENT_AUTHOR: &str = "You";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub gateway_id: String,
    pub title: String,
    pub description: String,
    pub assignee_ids: Vec<String>,
    pub session_key: Option<String>,
    pub source: String,
    pub channel: Option<String>,
    pub spawned_by: Option<String>,
}

impl NewTask {
    /// Status a freshly created task starts in.
    pub fn initial_status(&self) -> TaskStatus {
        let has_key = self
            .session_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if has_key && self.source != crate::session::MANUAL_SOURCE {
            TaskStatus::InProgress
        } else if !self.assignee_ids.is_empty() {
            TaskStatus::Assigned
        } else {
            TaskStatus::Inbox
        }
    }
}

/// Partial update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub assignee_ids: Option<Vec<String>>,
    pub session_key: Option<String>,
    pub run_id: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Applies the patch to `task`, returning the previous status when it changed.
    ///
    /// Assigning agents to an inbox task without an explicit status moves it to
    /// `assigned`; reaching `done` stamps `completed_at` once.
    pub fn apply(self, task: &mut Task, now: DateTime<Utc>) -> Option<TaskStatus> {
        let previous = task.status;
        if let Some(title) = self.title {
            task.title = title;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(session_key) = self.session_key {
            task.session_key = Some(session_key);
        }
        if let Some(run_id) = self.run_id {
            task.run_id = Some(run_id);
        }
        let mut status = self.status;
        if let Some(assignees) = self.assignee_ids {
            if status.is_none() && task.status == TaskStatus::Inbox && !assignees.is_empty() {
                status = Some(TaskStatus::Assigned);
            }
            task.assignee_ids = assignees;
        }
        if let Some(status) = status {
            task.status = status;
            if status == TaskStatus::Done && task.completed_at.is_none() {
                task.completed_at = Some(now);
            }
        }
        task.updated_at = now;
        (task.status != previous).then_some(previous)
    }
}

/// Result of binding a session key to a task that is being dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBinding {
    pub task: Task,
    /// Task that held the key before and had it cleared.
    pub released_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub gateway_id: String,
    pub task_id: String,
    pub content: String,
    pub from_agent: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewComment {
    pub task_id: String,
    pub content: String,
    pub from_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: i64,
    pub gateway_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub agent_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub gateway_id: String,
    pub kind: String,
    pub agent_name: String,
    pub message: String,
}

impl NewActivity {
    pub fn new(
        gateway_id: impl Into<String>,
        kind: impl Into<String>,
        agent_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            kind: kind.into(),
            agent_name: agent_name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub gateway_id: String,
    pub agent_name: String,
    pub content: String,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

pub const DEFAULT_DOCUMENT_KIND: &str = "deliverable";

/// A deliverable or note attached to a gateway and optionally to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub gateway_id: String,
    pub task_id: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewDocument {
    pub gateway_id: String,
    pub task_id: Option<String>,
    pub title: String,
    pub content: String,
    /// Defaults to [`DEFAULT_DOCUMENT_KIND`].
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub kind: Option<String>,
}

impl DocumentPatch {
    pub fn apply(self, document: &mut Document, now: DateTime<Utc>) {
        if let Some(title) = self.title {
            document.title = title;
        }
        if let Some(content) = self.content {
            document.content = content;
        }
        if let Some(kind) = self.kind {
            document.kind = kind;
        }
        document.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub gateway_id: String,
    pub content: String,
    pub mood: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewJournalEntry {
    pub gateway_id: String,
    pub content: String,
    pub mood: Option<String>,
    pub tags: Vec<String>,
}

pub mod activity_kind {
    pub const TASK_CREATED: &str = "task_created";
    pub const TASK_STATUS: &str = "task_status";
    pub const TASK_ARCHIVED: &str = "task_archived";
    pub const COMMENT_ADDED: &str = "comment_added";
    pub const TASK_DISPATCHED: &str = "task_dispatched";
    pub const TASK_DISPATCH_ERROR: &str = "task_dispatch_error";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const TASK_IDLE_REVIEW: &str = "task_idle_review";
    pub const DOCUMENT_CREATED: &str = "document_created";
}

/// Distinct `@name` mentions in order of first appearance.
pub fn parse_mentions(content: &str) -> Vec<String> {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    let pattern = MENTION.get_or_init(|| Regex::new(r"@([\w-]+)").expect("valid mention regex"));
    let mut mentions: Vec<String> = Vec::new();
    for capture in pattern.captures_iter(content) {
        let name = capture[1].to_string();
        if !mentions.contains(&name) {
            mentions.push(name);
        }
    }
    mentions
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: NewTask) -> Result<String, StoreError>;
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;
    async fn list_tasks(&self, gateway_id: &str) -> Result<Vec<Task>, StoreError>;
    async fn find_by_session_key(
        &self,
        gateway_id: &str,
        session_key: &str,
    ) -> Result<Option<Task>, StoreError>;
    async fn patch_task(&self, task_id: &str, patch: TaskPatch) -> Result<Task, StoreError>;
    /// Moves a task to `in_progress` on `session_key`, clearing the key from
    /// any other task of the same gateway that held it. Both happen in one
    /// write.
    async fn bind_session(
        &self,
        task_id: &str,
        session_key: &str,
        run_id: Option<String>,
    ) -> Result<SessionBinding, StoreError>;
    async fn archive_task(&self, task_id: &str) -> Result<Task, StoreError>;
    async fn delete_task(&self, task_id: &str) -> Result<(), StoreError>;
    async fn append_comment(&self, comment: NewComment) -> Result<Comment, StoreError>;
    async fn list_comments(&self, task_id: &str) -> Result<Vec<Comment>, StoreError>;
    async fn append_activity(&self, activity: NewActivity) -> Result<(), StoreError>;
    async fn list_activities(
        &self,
        gateway_id: &str,
        limit: usize,
    ) -> Result<Vec<Activity>, StoreError>;
    async fn list_notifications(
        &self,
        gateway_id: &str,
        undelivered_only: bool,
    ) -> Result<Vec<Notification>, StoreError>;
    async fn mark_notification_delivered(&self, notification_id: &str) -> Result<(), StoreError>;
    async fn create_document(&self, document: NewDocument) -> Result<Document, StoreError>;
    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError>;
    async fn list_documents(&self, gateway_id: &str) -> Result<Vec<Document>, StoreError>;
    async fn update_document(
        &self,
        document_id: &str,
        patch: DocumentPatch,
    ) -> Result<Document, StoreError>;
    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError>;
    async fn add_journal_entry(&self, entry: NewJournalEntry) -> Result<JournalEntry, StoreError>;
    /// Newest first.
    async fn list_journal(
        &self,
        gateway_id: &str,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, StoreError>;
    async fn delete_journal_entry(&self, entry_id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: "t".to_string(),
            gateway_id: "gw".to_string(),
            title: "title".to_string(),
            description: String::new(),
            status,
            assignee_ids: Vec::new(),
            session_key: None,
            run_id: None,
            source: "manual".to_string(),
            channel: None,
            spawned_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            archived_at: None,
        }
    }

    #[test]
    fn initial_status_follows_key_source_and_assignees() {
        let mut new_task = NewTask {
            gateway_id: "gw".to_string(),
            title: "x".to_string(),
            source: "gateway".to_string(),
            session_key: Some("agent:a:main".to_string()),
            ..NewTask::default()
        };
        assert_eq!(new_task.initial_status(), TaskStatus::InProgress);

        new_task.source = "manual".to_string();
        assert_eq!(new_task.initial_status(), TaskStatus::Inbox);

        new_task.assignee_ids = vec!["writer".to_string()];
        assert_eq!(new_task.initial_status(), TaskStatus::Assigned);
    }

    #[test]
    fn assigning_inbox_task_moves_it_to_assigned() {
        let mut current = task(TaskStatus::Inbox);
        let patch = TaskPatch {
            assignee_ids: Some(vec!["writer".to_string()]),
            ..TaskPatch::default()
        };
        let previous = patch.apply(&mut current, Utc::now());
        assert_eq!(previous, Some(TaskStatus::Inbox));
        assert_eq!(current.status, TaskStatus::Assigned);
    }

    #[test]
    fn done_stamps_completion_once() {
        let mut current = task(TaskStatus::Review);
        let first = Utc::now();
        TaskPatch::status(TaskStatus::Done).apply(&mut current, first);
        assert_eq!(current.completed_at, Some(first));

        let later = first + chrono::Duration::seconds(5);
        let previous = TaskPatch::status(TaskStatus::Done).apply(&mut current, later);
        assert_eq!(previous, None);
        assert_eq!(current.completed_at, Some(first));
        assert_eq!(current.updated_at, later);
    }

    #[test]
    fn mentions_are_deduplicated() {
        assert_eq!(
            parse_mentions("ping @writer and @ops-bot, again @writer"),
            vec!["writer".to_string(), "ops-bot".to_string()]
        );
        assert!(parse_mentions("no mentions here").is_empty());
    }
}
