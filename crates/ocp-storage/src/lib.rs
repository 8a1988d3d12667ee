use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ocp_core::store::{
    activity_kind, parse_mentions, Activity, Comment, Document, DocumentPatch, JournalEntry,
    NewActivity, NewComment, NewDocument, NewJournalEntry, NewTask, Notification, SessionBinding,
    StoreError, TaskPatch, DEFAULT_COMMENT_AUTHOR, DEFAULT_DOCUMENT_KIND,
};
use ocp_core::{Task, TaskStatus, TaskStore};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CONTROLPANE_SCHEMA_VERSION: i64 = 2;

const TASK_COLUMNS: &str = "task_id, gateway_id, title, description, status, assignee_ids_json, \
     session_key, run_id, source, channel, spawned_by, created_at, updated_at, completed_at, \
     archived_at";

const DOCUMENT_COLUMNS: &str =
    "document_id, gateway_id, task_id, title, content, kind, created_at, updated_at";

const MENTION_EXCERPT_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate name: {0}")]
    DuplicateName(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("blocking store task failed: {0}")]
    Join(String),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => StoreError::NotFound(what),
            StorageError::DuplicateName(name) => StoreError::DuplicateName(name),
            StorageError::Invalid(what) => StoreError::Invalid(what),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub selected: bool,
    pub created_at: DateTime<Utc>,
}

/// Row counts removed when a gateway's data is purged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub tasks: usize,
    pub comments: usize,
    pub activities: usize,
    pub notifications: usize,
    pub documents: usize,
    pub journal_entries: usize,
}

/// SQLite-backed store. Clones share one connection; the async
/// [`TaskStore`] surface runs each call on the blocking pool.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > CONTROLPANE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CONTROLPANE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.lock()?;
            let sql = include_str!("../migrations/0001_controlpane_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let conn = self.lock()?;
            let sql = include_str!("../migrations/0002_documents_journal.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn add_gateway(
        &self,
        name: &str,
        url: &str,
        token: Option<&str>,
    ) -> Result<GatewayConfig, StorageError> {
        let name = name.trim();
        let conn = self.lock()?;
        if gateway_by_name(&conn, name)?.is_some() {
            return Err(StorageError::DuplicateName(name.to_string()));
        }
        let has_selection: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM gateway_configs WHERE selected = 1)",
            [],
            |row| row.get(0),
        )?;
        let config = GatewayConfig {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            url: url.trim().trim_end_matches('/').to_string(),
            token: token.map(str::to_string).filter(|token| !token.is_empty()),
            selected: !has_selection,
            created_at: Utc::now(),
        };
        conn.execute(
            "
            INSERT INTO gateway_configs (gateway_id, name, url, token, selected, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                config.id,
                config.name,
                config.url,
                config.token,
                config.selected,
                format_ts(config.created_at)
            ],
        )
        .map_err(|err| match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => StorageError::DuplicateName(name.to_string()),
            _ => StorageError::Sqlite(err),
        })?;
        Ok(config)
    }

    pub fn list_gateways(&self) -> Result<Vec<GatewayConfig>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT gateway_id, name, url, token, selected, created_at
            FROM gateway_configs
            ORDER BY created_at ASC, name ASC
            ",
        )?;
        let rows = stmt.query_map([], gateway_from_row)?;
        let mut gateways = Vec::new();
        for row in rows {
            gateways.push(row??);
        }
        Ok(gateways)
    }

    pub fn gateway_by_name(&self, name: &str) -> Result<Option<GatewayConfig>, StorageError> {
        let conn = self.lock()?;
        gateway_by_name(&conn, name.trim())
    }

    pub fn selected_gateway(&self) -> Result<Option<GatewayConfig>, StorageError> {
        let conn = self.lock()?;
        conn.query_row(
            "
            SELECT gateway_id, name, url, token, selected, created_at
            FROM gateway_configs
            WHERE selected = 1
            LIMIT 1
            ",
            [],
            gateway_from_row,
        )
        .optional()?
        .transpose()
    }

    pub fn select_gateway(&self, name: &str) -> Result<GatewayConfig, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let Some(mut config) = gateway_by_name(&tx, name.trim())? else {
            return Err(StorageError::NotFound(format!("gateway {name}")));
        };
        tx.execute("UPDATE gateway_configs SET selected = 0", [])?;
        tx.execute(
            "UPDATE gateway_configs SET selected = 1 WHERE gateway_id = ?1",
            [&config.id],
        )?;
        tx.commit()?;
        config.selected = true;
        Ok(config)
    }

    /// Removes the gateway entry; with `purge`, also every record scoped to it.
    pub fn remove_gateway(
        &self,
        name: &str,
        purge: bool,
    ) -> Result<(GatewayConfig, PurgeReport), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let Some(config) = gateway_by_name(&tx, name.trim())? else {
            return Err(StorageError::NotFound(format!("gateway {name}")));
        };
        let report = if purge {
            purge_gateway_data(&tx, &config.id)?
        } else {
            PurgeReport::default()
        };
        tx.execute(
            "DELETE FROM gateway_configs WHERE gateway_id = ?1",
            [&config.id],
        )?;
        tx.commit()?;
        Ok((config, report))
    }

    pub fn remove_gateway_data(&self, gateway_id: &str) -> Result<PurgeReport, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let report = purge_gateway_data(&tx, gateway_id)?;
        tx.commit()?;
        Ok(report)
    }

    fn create_task_sync(&self, task: NewTask) -> Result<String, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let session_key = task
            .session_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        if let Some(key) = session_key.as_deref() {
            if let Some(existing) = task_by_session_key(&tx, &task.gateway_id, key)? {
                debug!(
                    "task_create_deduplicated: session_key={key} task_id={}",
                    existing.id
                );
                return Ok(existing.id);
            }
        }

        let now = Utc::now();
        let status = task.initial_status();
        let task_id = Uuid::new_v4().to_string();
        let assignees = serde_json::to_string(&task.assignee_ids)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let inserted = tx.execute(
            "
            INSERT INTO tasks (
                task_id, gateway_id, title, description, status, assignee_ids_json,
                session_key, run_id, source, channel, spawned_by, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, ?10, ?11, ?11)
            ",
            params![
                task_id,
                task.gateway_id,
                task.title,
                task.description,
                status.as_str(),
                assignees,
                session_key,
                task.source,
                task.channel,
                task.spawned_by,
                format_ts(now)
            ],
        );
        if let Err(err) = inserted {
            if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                if let Some(key) = session_key.as_deref() {
                    if let Some(existing) = task_by_session_key(&tx, &task.gateway_id, key)? {
                        return Ok(existing.id);
                    }
                }
            }
            return Err(err.into());
        }

        insert_activity(
            &tx,
            &task.gateway_id,
            activity_kind::TASK_CREATED,
            task.spawned_by.as_deref().unwrap_or(&task.source),
            &format!("Created task: {}", task.title),
            now,
        )?;
        tx.commit()?;
        Ok(task_id)
    }

    fn get_task_sync(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        let conn = self.lock()?;
        task_by_id(&conn, task_id)
    }

    fn list_tasks_sync(&self, gateway_id: &str) -> Result<Vec<Task>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE gateway_id = ?1
            ORDER BY created_at ASC, task_id ASC
            "
        ))?;
        let rows = stmt.query_map([gateway_id], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    fn find_by_session_key_sync(
        &self,
        gateway_id: &str,
        session_key: &str,
    ) -> Result<Option<Task>, StorageError> {
        let conn = self.lock()?;
        task_by_session_key(&conn, gateway_id, session_key)
    }

    fn patch_task_sync(&self, task_id: &str, patch: TaskPatch) -> Result<Task, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut task = task_by_id(&tx, task_id)?
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        let now = Utc::now();
        let previous = patch.apply(&mut task, now);
        write_task(&tx, &task)?;
        if let Some(previous) = previous {
            insert_activity(
                &tx,
                &task.gateway_id,
                activity_kind::TASK_STATUS,
                task.primary_assignee().unwrap_or(DEFAULT_COMMENT_AUTHOR),
                &format!("{}: {} -> {}", task.title, previous, task.status),
                now,
            )?;
        }
        tx.commit()?;
        Ok(task)
    }

    fn bind_session_sync(
        &self,
        task_id: &str,
        session_key: &str,
        run_id: Option<String>,
    ) -> Result<SessionBinding, StorageError> {
        let session_key = session_key.trim();
        if session_key.is_empty() {
            return Err(StorageError::Invalid("session key is empty".to_string()));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut task = task_by_id(&tx, task_id)?
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        let now = Utc::now();

        let mut released_from = None;
        if let Some(holder) = task_by_session_key(&tx, &task.gateway_id, session_key)? {
            if holder.id != task.id {
                tx.execute(
                    "UPDATE tasks SET session_key = NULL, updated_at = ?2 WHERE task_id = ?1",
                    params![holder.id, format_ts(now)],
                )?;
                debug!(
                    "session_key_released: session_key={session_key} from={} to={}",
                    holder.id, task.id
                );
                released_from = Some(holder.id);
            }
        }

        let patch = TaskPatch {
            status: Some(TaskStatus::InProgress),
            session_key: Some(session_key.to_string()),
            run_id,
            ..TaskPatch::default()
        };
        let previous = patch.apply(&mut task, now);
        write_task(&tx, &task)?;
        if let Some(previous) = previous {
            insert_activity(
                &tx,
                &task.gateway_id,
                activity_kind::TASK_STATUS,
                task.primary_assignee().unwrap_or(DEFAULT_COMMENT_AUTHOR),
                &format!("{}: {} -> {}", task.title, previous, task.status),
                now,
            )?;
        }
        tx.commit()?;
        Ok(SessionBinding {
            task,
            released_from,
        })
    }

    fn archive_task_sync(&self, task_id: &str) -> Result<Task, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut task = task_by_id(&tx, task_id)?
            .ok_or_else(|| StorageError::NotFound(format!("task {task_id}")))?;
        let now = Utc::now();
        task.status = TaskStatus::Archived;
        task.archived_at = Some(now);
        task.completed_at.get_or_insert(now);
        task.updated_at = now;
        write_task(&tx, &task)?;
        insert_activity(
            &tx,
            &task.gateway_id,
            activity_kind::TASK_ARCHIVED,
            DEFAULT_COMMENT_AUTHOR,
            &format!("Archived task: {}", task.title),
            now,
        )?;
        tx.commit()?;
        Ok(task)
    }

    fn delete_task_sync(&self, task_id: &str) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM comments WHERE task_id = ?1", [task_id])?;
        tx.execute(
            "UPDATE documents SET task_id = NULL WHERE task_id = ?1",
            [task_id],
        )?;
        let removed = tx.execute("DELETE FROM tasks WHERE task_id = ?1", [task_id])?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!("task {task_id}")));
        }
        tx.commit()?;
        Ok(())
    }

    fn append_comment_sync(&self, comment: NewComment) -> Result<Comment, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let task = task_by_id(&tx, &comment.task_id)?
            .ok_or_else(|| StorageError::NotFound(format!("task {}", comment.task_id)))?;
        let now = Utc::now();
        let stored = Comment {
            id: Uuid::new_v4().to_string(),
            gateway_id: task.gateway_id.clone(),
            task_id: task.id.clone(),
            content: comment.content,
            from_agent: comment
                .from_agent
                .filter(|author| !author.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_COMMENT_AUTHOR.to_string()),
            created_at: now,
        };
        tx.execute(
            "
            INSERT INTO comments (comment_id, gateway_id, task_id, content, from_agent, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                stored.id,
                stored.gateway_id,
                stored.task_id,
                stored.content,
                stored.from_agent,
                format_ts(now)
            ],
        )?;
        insert_activity(
            &tx,
            &task.gateway_id,
            activity_kind::COMMENT_ADDED,
            &stored.from_agent,
            &format!("Commented on: {}", task.title),
            now,
        )?;
        let excerpt: String = stored.content.chars().take(MENTION_EXCERPT_CHARS).collect();
        for agent_name in parse_mentions(&stored.content) {
            tx.execute(
                "
                INSERT INTO notifications (notification_id, gateway_id, agent_name, content, delivered, created_at)
                VALUES (?1, ?2, ?3, ?4, 0, ?5)
                ",
                params![
                    Uuid::new_v4().to_string(),
                    task.gateway_id,
                    agent_name,
                    format!("{} mentioned you on \"{}\": {}", stored.from_agent, task.title, excerpt),
                    format_ts(now)
                ],
            )?;
        }
        tx.commit()?;
        Ok(stored)
    }

    fn list_comments_sync(&self, task_id: &str) -> Result<Vec<Comment>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT comment_id, gateway_id, task_id, content, from_agent, created_at
            FROM comments
            WHERE task_id = ?1
            ORDER BY created_at ASC, rowid ASC
            ",
        )?;
        let rows = stmt.query_map([task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut comments = Vec::new();
        for row in rows {
            let (id, gateway_id, task_id, content, from_agent, created_at) = row?;
            comments.push(Comment {
                id,
                gateway_id,
                task_id,
                content,
                from_agent,
                created_at: parse_timestamp(created_at)?,
            });
        }
        Ok(comments)
    }

    fn append_activity_sync(&self, activity: NewActivity) -> Result<(), StorageError> {
        let conn = self.lock()?;
        insert_activity(
            &conn,
            &activity.gateway_id,
            &activity.kind,
            &activity.agent_name,
            &activity.message,
            Utc::now(),
        )
    }

    fn list_activities_sync(
        &self,
        gateway_id: &str,
        limit: usize,
    ) -> Result<Vec<Activity>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT activity_id, gateway_id, kind, agent_name, message, created_at
            FROM activities
            WHERE gateway_id = ?1
            ORDER BY activity_id DESC
            LIMIT ?2
            ",
        )?;
        let rows = stmt.query_map(params![gateway_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut activities = Vec::new();
        for row in rows {
            let (id, gateway_id, kind, agent_name, message, created_at) = row?;
            activities.push(Activity {
                id,
                gateway_id,
                kind,
                agent_name,
                message,
                created_at: parse_timestamp(created_at)?,
            });
        }
        Ok(activities)
    }

    fn list_notifications_sync(
        &self,
        gateway_id: &str,
        undelivered_only: bool,
    ) -> Result<Vec<Notification>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT notification_id, gateway_id, agent_name, content, delivered, created_at
            FROM notifications
            WHERE gateway_id = ?1 AND (?2 = 0 OR delivered = 0)
            ORDER BY created_at ASC, rowid ASC
            ",
        )?;
        let rows = stmt.query_map(params![gateway_id, undelivered_only], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut notifications = Vec::new();
        for row in rows {
            let (id, gateway_id, agent_name, content, delivered, created_at) = row?;
            notifications.push(Notification {
                id,
                gateway_id,
                agent_name,
                content,
                delivered,
                created_at: parse_timestamp(created_at)?,
            });
        }
        Ok(notifications)
    }

    fn mark_notification_delivered_sync(&self, notification_id: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE notifications SET delivered = 1 WHERE notification_id = ?1",
            [notification_id],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!(
                "notification {notification_id}"
            )));
        }
        Ok(())
    }

    fn create_document_sync(&self, document: NewDocument) -> Result<Document, StorageError> {
        let title = document.title.trim();
        if title.is_empty() {
            return Err(StorageError::Invalid("document title is empty".to_string()));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let task_id = document
            .task_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if let Some(task_id) = task_id.as_deref() {
            let owned = task_by_id(&tx, task_id)?
                .is_some_and(|task| task.gateway_id == document.gateway_id);
            if !owned {
                return Err(StorageError::NotFound(format!("task {task_id}")));
            }
        }
        let now = Utc::now();
        let stored = Document {
            id: Uuid::new_v4().to_string(),
            gateway_id: document.gateway_id,
            task_id,
            title: title.to_string(),
            content: document.content,
            kind: document
                .kind
                .map(|kind| kind.trim().to_string())
                .filter(|kind| !kind.is_empty())
                .unwrap_or_else(|| DEFAULT_DOCUMENT_KIND.to_string()),
            created_at: now,
            updated_at: now,
        };
        tx.execute(
            "
            INSERT INTO documents (
                document_id, gateway_id, task_id, title, content, kind, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ",
            params![
                stored.id,
                stored.gateway_id,
                stored.task_id,
                stored.title,
                stored.content,
                stored.kind,
                format_ts(now)
            ],
        )?;
        insert_activity(
            &tx,
            &stored.gateway_id,
            activity_kind::DOCUMENT_CREATED,
            DEFAULT_COMMENT_AUTHOR,
            &format!("Created document: {}", stored.title),
            now,
        )?;
        tx.commit()?;
        Ok(stored)
    }

    fn get_document_sync(&self, document_id: &str) -> Result<Option<Document>, StorageError> {
        let conn = self.lock()?;
        document_by_id(&conn, document_id)
    }

    fn list_documents_sync(&self, gateway_id: &str) -> Result<Vec<Document>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "
            SELECT {DOCUMENT_COLUMNS}
            FROM documents
            WHERE gateway_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "
        ))?;
        let rows = stmt.query_map([gateway_id], document_from_row)?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row??);
        }
        Ok(documents)
    }

    fn update_document_sync(
        &self,
        document_id: &str,
        patch: DocumentPatch,
    ) -> Result<Document, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut document = document_by_id(&tx, document_id)?
            .ok_or_else(|| StorageError::NotFound(format!("document {document_id}")))?;
        patch.apply(&mut document, Utc::now());
        tx.execute(
            "
            UPDATE documents
            SET title = ?2, content = ?3, kind = ?4, updated_at = ?5
            WHERE document_id = ?1
            ",
            params![
                document.id,
                document.title,
                document.content,
                document.kind,
                format_ts(document.updated_at)
            ],
        )?;
        tx.commit()?;
        Ok(document)
    }

    fn delete_document_sync(&self, document_id: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM documents WHERE document_id = ?1", [document_id])?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!("document {document_id}")));
        }
        Ok(())
    }

    fn add_journal_entry_sync(&self, entry: NewJournalEntry) -> Result<JournalEntry, StorageError> {
        if entry.content.trim().is_empty() {
            return Err(StorageError::Invalid("journal entry is empty".to_string()));
        }
        let stored = JournalEntry {
            id: Uuid::new_v4().to_string(),
            gateway_id: entry.gateway_id,
            content: entry.content,
            mood: entry.mood.filter(|mood| !mood.trim().is_empty()),
            tags: entry.tags,
            created_at: Utc::now(),
        };
        let tags = serde_json::to_string(&stored.tags)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO journal (entry_id, gateway_id, content, mood, tags_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                stored.id,
                stored.gateway_id,
                stored.content,
                stored.mood,
                tags,
                format_ts(stored.created_at)
            ],
        )?;
        Ok(stored)
    }

    fn list_journal_sync(
        &self,
        gateway_id: &str,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT entry_id, gateway_id, content, mood, tags_json, created_at
            FROM journal
            WHERE gateway_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            ",
        )?;
        let rows = stmt.query_map(params![gateway_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (id, gateway_id, content, mood, tags_json, created_at) = row?;
            entries.push(JournalEntry {
                id,
                gateway_id,
                content,
                mood,
                tags: serde_json::from_str(&tags_json)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
                created_at: parse_timestamp(created_at)?,
            });
        }
        Ok(entries)
    }

    fn delete_journal_entry_sync(&self, entry_id: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM journal WHERE entry_id = ?1", [entry_id])?;
        if removed == 0 {
            return Err(StorageError::NotFound(format!("journal entry {entry_id}")));
        }
        Ok(())
    }

    /// Runs a synchronous store call on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteTaskStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.clone();
        let result = tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| StorageError::Join(err.to_string()))?;
        Ok(result?)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(&self, task: NewTask) -> Result<String, StoreError> {
        self.blocking(move |store| store.create_task_sync(task)).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.to_string();
        self.blocking(move |store| store.get_task_sync(&task_id)).await
    }

    async fn list_tasks(&self, gateway_id: &str) -> Result<Vec<Task>, StoreError> {
        let gateway_id = gateway_id.to_string();
        self.blocking(move |store| store.list_tasks_sync(&gateway_id)).await
    }

    async fn find_by_session_key(
        &self,
        gateway_id: &str,
        session_key: &str,
    ) -> Result<Option<Task>, StoreError> {
        let gateway_id = gateway_id.to_string();
        let session_key = session_key.to_string();
        self.blocking(move |store| store.find_by_session_key_sync(&gateway_id, &session_key)).await
    }

    async fn patch_task(&self, task_id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let task_id = task_id.to_string();
        self.blocking(move |store| store.patch_task_sync(&task_id, patch)).await
    }

    async fn bind_session(
        &self,
        task_id: &str,
        session_key: &str,
        run_id: Option<String>,
    ) -> Result<SessionBinding, StoreError> {
        let task_id = task_id.to_string();
        let session_key = session_key.to_string();
        self.blocking(move |store| store.bind_session_sync(&task_id, &session_key, run_id)).await
    }

    async fn archive_task(&self, task_id: &str) -> Result<Task, StoreError> {
        let task_id = task_id.to_string();
        self.blocking(move |store| store.archive_task_sync(&task_id)).await
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let task_id = task_id.to_string();
        self.blocking(move |store| store.delete_task_sync(&task_id)).await
    }

    async fn append_comment(&self, comment: NewComment) -> Result<Comment, StoreError> {
        self.blocking(move |store| store.append_comment_sync(comment)).await
    }

    async fn list_comments(&self, task_id: &str) -> Result<Vec<Comment>, StoreError> {
        let task_id = task_id.to_string();
        self.blocking(move |store| store.list_comments_sync(&task_id)).await
    }

    async fn append_activity(&self, activity: NewActivity) -> Result<(), StoreError> {
        self.blocking(move |store| store.append_activity_sync(activity)).await
    }

    async fn list_activities(
        &self,
        gateway_id: &str,
        limit: usize,
    ) -> Result<Vec<Activity>, StoreError> {
        let gateway_id = gateway_id.to_string();
        self.blocking(move |store| store.list_activities_sync(&gateway_id, limit)).await
    }

    async fn list_notifications(
        &self,
        gateway_id: &str,
        undelivered_only: bool,
    ) -> Result<Vec<Notification>, StoreError> {
        let gateway_id = gateway_id.to_string();
        self.blocking(move |store| store.list_notifications_sync(&gateway_id, undelivered_only))
            .await
    }

    async fn mark_notification_delivered(&self, notification_id: &str) -> Result<(), StoreError> {
        let notification_id = notification_id.to_string();
        self.blocking(move |store| store.mark_notification_delivered_sync(&notification_id)).await
    }

    async fn create_document(&self, document: NewDocument) -> Result<Document, StoreError> {
        self.blocking(move |store| store.create_document_sync(document)).await
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        let document_id = document_id.to_string();
        self.blocking(move |store| store.get_document_sync(&document_id)).await
    }

    async fn list_documents(&self, gateway_id: &str) -> Result<Vec<Document>, StoreError> {
        let gateway_id = gateway_id.to_string();
        self.blocking(move |store| store.list_documents_sync(&gateway_id)).await
    }

    async fn update_document(
        &self,
        document_id: &str,
        patch: DocumentPatch,
    ) -> Result<Document, StoreError> {
        let document_id = document_id.to_string();
        self.blocking(move |store| store.update_document_sync(&document_id, patch)).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let document_id = document_id.to_string();
        self.blocking(move |store| store.delete_document_sync(&document_id)).await
    }

    async fn add_journal_entry(&self, entry: NewJournalEntry) -> Result<JournalEntry, StoreError> {
        self.blocking(move |store| store.add_journal_entry_sync(entry)).await
    }

    async fn list_journal(
        &self,
        gateway_id: &str,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        let gateway_id = gateway_id.to_string();
        self.blocking(move |store| store.list_journal_sync(&gateway_id, limit)).await
    }

    async fn delete_journal_entry(&self, entry_id: &str) -> Result<(), StoreError> {
        let entry_id = entry_id.to_string();
        self.blocking(move |store| store.delete_journal_entry_sync(&entry_id)).await
    }
}

fn task_by_id(conn: &Connection, task_id: &str) -> Result<Option<Task>, StorageError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
        [task_id],
        task_from_row,
    )
    .optional()?
    .transpose()
}

fn task_by_session_key(
    conn: &Connection,
    gateway_id: &str,
    session_key: &str,
) -> Result<Option<Task>, StorageError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE gateway_id = ?1 AND session_key = ?2"),
        params![gateway_id, session_key],
        task_from_row,
    )
    .optional()?
    .transpose()
}

fn write_task(tx: &Transaction<'_>, task: &Task) -> Result<(), StorageError> {
    let assignees = serde_json::to_string(&task.assignee_ids)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    tx.execute(
        "
        UPDATE tasks
        SET title = ?2,
            description = ?3,
            status = ?4,
            assignee_ids_json = ?5,
            session_key = ?6,
            run_id = ?7,
            updated_at = ?8,
            completed_at = ?9,
            archived_at = ?10
        WHERE task_id = ?1
        ",
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            assignees,
            task.session_key,
            task.run_id,
            format_ts(task.updated_at),
            task.completed_at.map(format_ts),
            task.archived_at.map(format_ts)
        ],
    )?;
    Ok(())
}

fn insert_activity(
    conn: &Connection,
    gateway_id: &str,
    kind: &str,
    agent_name: &str,
    message: &str,
    at: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO activities (gateway_id, kind, agent_name, message, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
        params![gateway_id, kind, agent_name, message, format_ts(at)],
    )?;
    Ok(())
}

fn purge_gateway_data(conn: &Connection, gateway_id: &str) -> Result<PurgeReport, StorageError> {
    let comments = conn.execute("DELETE FROM comments WHERE gateway_id = ?1", [gateway_id])?;
    let tasks = conn.execute("DELETE FROM tasks WHERE gateway_id = ?1", [gateway_id])?;
    let activities = conn.execute("DELETE FROM activities WHERE gateway_id = ?1", [gateway_id])?;
    let notifications =
        conn.execute("DELETE FROM notifications WHERE gateway_id = ?1", [gateway_id])?;
    let documents = conn.execute("DELETE FROM documents WHERE gateway_id = ?1", [gateway_id])?;
    let journal_entries = conn.execute("DELETE FROM journal WHERE gateway_id = ?1", [gateway_id])?;
    Ok(PurgeReport {
        tasks,
        comments,
        activities,
        notifications,
        documents,
        journal_entries,
    })
}

fn document_by_id(conn: &Connection, document_id: &str) -> Result<Option<Document>, StorageError> {
    conn.query_row(
        &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE document_id = ?1"),
        [document_id],
        document_from_row,
    )
    .optional()?
    .transpose()
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Document, StorageError>> {
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    let id: String = row.get(0)?;
    let gateway_id: String = row.get(1)?;
    let task_id: Option<String> = row.get(2)?;
    let title: String = row.get(3)?;
    let content: String = row.get(4)?;
    let kind: String = row.get(5)?;

    let build = || -> Result<Document, StorageError> {
        Ok(Document {
            id,
            gateway_id,
            task_id,
            title,
            content,
            kind,
            created_at: parse_timestamp(created_at)?,
            updated_at: parse_timestamp(updated_at)?,
        })
    };
    Ok(build())
}

fn gateway_by_name(conn: &Connection, name: &str) -> Result<Option<GatewayConfig>, StorageError> {
    conn.query_row(
        "
        SELECT gateway_id, name, url, token, selected, created_at
        FROM gateway_configs
        WHERE name = ?1 COLLATE NOCASE
        LIMIT 1
        ",
        [name],
        gateway_from_row,
    )
    .optional()?
    .transpose()
}

fn gateway_from_row(row: &Row<'_>) -> rusqlite::Result<Result<GatewayConfig, StorageError>> {
    let created_at = match parse_timestamp(row.get(5)?) {
        Ok(created_at) => created_at,
        Err(err) => return Ok(Err(err)),
    };
    Ok(Ok(GatewayConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        token: row.get(3)?,
        selected: row.get(4)?,
        created_at,
    }))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Task, StorageError>> {
    let status: String = row.get(4)?;
    let assignees_json: String = row.get(5)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let completed_at: Option<String> = row.get(13)?;
    let archived_at: Option<String> = row.get(14)?;
    let id: String = row.get(0)?;
    let gateway_id: String = row.get(1)?;
    let title: String = row.get(2)?;
    let description: String = row.get(3)?;
    let session_key: Option<String> = row.get(6)?;
    let run_id: Option<String> = row.get(7)?;
    let source: String = row.get(8)?;
    let channel: Option<String> = row.get(9)?;
    let spawned_by: Option<String> = row.get(10)?;

    let build = || -> Result<Task, StorageError> {
        Ok(Task {
            id,
            gateway_id,
            title,
            description,
            status: status.parse().map_err(StorageError::Serialization)?,
            assignee_ids: serde_json::from_str(&assignees_json)
                .map_err(|err| StorageError::Serialization(err.to_string()))?,
            session_key,
            run_id,
            source,
            channel,
            spawned_by,
            created_at: parse_timestamp(created_at)?,
            updated_at: parse_timestamp(updated_at)?,
            completed_at: completed_at.map(parse_timestamp).transpose()?,
            archived_at: archived_at.map(parse_timestamp).transpose()?,
        })
    };
    Ok(build())
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn new_task(gateway_id: &str, title: &str) -> NewTask {
        NewTask {
            gateway_id: gateway_id.to_string(),
            title: title.to_string(),
            source: "manual".to_string(),
            ..NewTask::default()
        }
    }

    fn discovered(gateway_id: &str, session_key: &str) -> NewTask {
        NewTask {
            gateway_id: gateway_id.to_string(),
            title: "Task for writer".to_string(),
            session_key: Some(session_key.to_string()),
            assignee_ids: vec!["writer".to_string()],
            source: "gateway".to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn migration_creates_controlpane_tables() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        for table in [
            "gateway_configs",
            "tasks",
            "comments",
            "activities",
            "notifications",
            "documents",
            "journal",
        ] {
            assert!(store.table_exists(table).expect("table check"));
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            CONTROLPANE_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_file_keeps_schema_and_rows() {
        let file = NamedTempFile::new().expect("temp file");
        let task_id = {
            let store = SqliteTaskStore::open(file.path()).expect("open db");
            store
                .create_task_sync(new_task("gw", "Persist me"))
                .expect("create")
        };
        let store = SqliteTaskStore::open(file.path()).expect("reopen db");
        let task = store
            .get_task_sync(&task_id)
            .expect("get")
            .expect("task exists");
        assert_eq!(task.title, "Persist me");
        assert_eq!(task.status, TaskStatus::Inbox);
    }

    #[test]
    fn create_with_existing_session_key_returns_same_id() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let first = store
            .create_task_sync(discovered("gw", "agent:writer:main"))
            .expect("create");
        let second = store
            .create_task_sync(discovered("gw", "agent:writer:main"))
            .expect("create again");
        assert_eq!(first, second);
        assert_eq!(store.list_tasks_sync("gw").expect("list").len(), 1);

        let task = store.get_task_sync(&first).expect("get").expect("task");
        assert_eq!(task.status, TaskStatus::InProgress);

        let other_gateway = store
            .create_task_sync(discovered("gw-2", "agent:writer:main"))
            .expect("other gateway");
        assert_ne!(first, other_gateway);
    }

    #[test]
    fn patch_records_status_activity_and_stamps_done() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let id = store
            .create_task_sync(new_task("gw", "Ship release"))
            .expect("create");

        let task = store
            .patch_task_sync(
                &id,
                TaskPatch {
                    assignee_ids: Some(vec!["ops".to_string()]),
                    ..TaskPatch::default()
                },
            )
            .expect("assign");
        assert_eq!(task.status, TaskStatus::Assigned);

        let task = store
            .patch_task_sync(&id, TaskPatch::status(TaskStatus::Done))
            .expect("done");
        assert!(task.completed_at.is_some());

        let kinds: Vec<String> = store
            .list_activities_sync("gw", 10)
            .expect("activities")
            .into_iter()
            .map(|activity| activity.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                activity_kind::TASK_STATUS.to_string(),
                activity_kind::TASK_STATUS.to_string(),
                activity_kind::TASK_CREATED.to_string(),
            ]
        );
    }

    #[test]
    fn patch_missing_task_is_not_found() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let err = store
            .patch_task_sync("nope", TaskPatch::status(TaskStatus::Done))
            .expect_err("missing");
        assert!(matches!(StoreError::from(err), StoreError::NotFound(_)));
    }

    #[test]
    fn archive_stamps_completion_and_archive_time() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let id = store
            .create_task_sync(new_task("gw", "Old work"))
            .expect("create");
        let task = store.archive_task_sync(&id).expect("archive");
        assert_eq!(task.status, TaskStatus::Archived);
        assert!(task.archived_at.is_some());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn comments_record_activity_and_mention_notifications() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let id = store
            .create_task_sync(new_task("gw", "Review copy"))
            .expect("create");
        let comment = store
            .append_comment_sync(NewComment {
                task_id: id.clone(),
                content: "@writer please check with @editor".to_string(),
                from_agent: None,
            })
            .expect("comment");
        assert_eq!(comment.from_agent, DEFAULT_COMMENT_AUTHOR);

        let notifications = store
            .list_notifications_sync("gw", true)
            .expect("notifications");
        let names: Vec<&str> = notifications
            .iter()
            .map(|notification| notification.agent_name.as_str())
            .collect();
        assert_eq!(names, vec!["writer", "editor"]);

        store
            .mark_notification_delivered_sync(&notifications[0].id)
            .expect("deliver");
        assert_eq!(
            store
                .list_notifications_sync("gw", true)
                .expect("pending")
                .len(),
            1
        );
        assert_eq!(
            store
                .list_notifications_sync("gw", false)
                .expect("all")
                .len(),
            2
        );
    }

    #[test]
    fn delete_cascades_to_comments() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let id = store
            .create_task_sync(new_task("gw", "Temporary"))
            .expect("create");
        store
            .append_comment_sync(NewComment {
                task_id: id.clone(),
                content: "note".to_string(),
                from_agent: Some("writer".to_string()),
            })
            .expect("comment");
        store.delete_task_sync(&id).expect("delete");
        assert!(store.list_comments_sync(&id).expect("comments").is_empty());
        assert!(store.get_task_sync(&id).expect("get").is_none());
        assert!(matches!(
            store.delete_task_sync(&id),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn gateway_names_are_unique_case_insensitive() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let home = store
            .add_gateway("Home", "ws://127.0.0.1:18789/", None)
            .expect("add");
        assert!(home.selected);
        assert_eq!(home.url, "ws://127.0.0.1:18789");

        let err = store
            .add_gateway("home", "ws://other", None)
            .expect_err("duplicate");
        assert!(matches!(err, StorageError::DuplicateName(_)));

        let lab = store
            .add_gateway("Lab", "ws://lab:18789", Some("secret"))
            .expect("add lab");
        assert!(!lab.selected);

        store.select_gateway("LAB").expect("select");
        let selected = store
            .selected_gateway()
            .expect("selected")
            .expect("some gateway");
        assert_eq!(selected.name, "Lab");
        assert_eq!(selected.token.as_deref(), Some("secret"));
    }

    #[test]
    fn removing_gateway_with_purge_drops_scoped_rows() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let gateway = store.add_gateway("Home", "ws://home", None).expect("add");
        let id = store
            .create_task_sync(new_task(&gateway.id, "Scoped"))
            .expect("create");
        store
            .append_comment_sync(NewComment {
                task_id: id,
                content: "hi @ops".to_string(),
                from_agent: None,
            })
            .expect("comment");
        store
            .create_document_sync(NewDocument {
                gateway_id: gateway.id.clone(),
                title: "Release notes".to_string(),
                ..NewDocument::default()
            })
            .expect("document");
        store
            .add_journal_entry_sync(NewJournalEntry {
                gateway_id: gateway.id.clone(),
                content: "Quiet day".to_string(),
                ..NewJournalEntry::default()
            })
            .expect("journal");
        store
            .create_task_sync(new_task("elsewhere", "Keep"))
            .expect("create other");
        store
            .add_journal_entry_sync(NewJournalEntry {
                gateway_id: "elsewhere".to_string(),
                content: "Keep me too".to_string(),
                ..NewJournalEntry::default()
            })
            .expect("other journal");

        let (_, report) = store.remove_gateway("home", true).expect("remove");
        assert_eq!(report.tasks, 1);
        assert_eq!(report.comments, 1);
        assert_eq!(report.notifications, 1);
        assert_eq!(report.activities, 3);
        assert_eq!(report.documents, 1);
        assert_eq!(report.journal_entries, 1);
        assert!(store.list_gateways().expect("list").is_empty());
        assert!(store.list_documents_sync(&gateway.id).expect("docs").is_empty());
        assert_eq!(store.list_tasks_sync("elsewhere").expect("list").len(), 1);
        assert_eq!(store.list_journal_sync("elsewhere", 10).expect("journal").len(), 1);
    }

    #[test]
    fn binding_a_held_session_key_moves_it_to_the_new_task() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let mut first = new_task("gw", "First");
        first.assignee_ids = vec!["writer".to_string()];
        let first = store.create_task_sync(first).expect("create first");
        store
            .bind_session_sync(&first, "agent:writer:main", Some("run-1".to_string()))
            .expect("bind first");
        store
            .patch_task_sync(&first, TaskPatch::status(TaskStatus::Review))
            .expect("review");

        let mut second = new_task("gw", "Second");
        second.assignee_ids = vec!["writer".to_string()];
        let second = store.create_task_sync(second).expect("create second");
        let binding = store
            .bind_session_sync(&second, "agent:writer:main", Some("run-2".to_string()))
            .expect("bind second");

        assert_eq!(binding.released_from.as_deref(), Some(first.as_str()));
        assert_eq!(binding.task.status, TaskStatus::InProgress);
        assert_eq!(binding.task.session_key.as_deref(), Some("agent:writer:main"));
        assert_eq!(binding.task.run_id.as_deref(), Some("run-2"));

        let first = store.get_task_sync(&first).expect("get").expect("first");
        assert_eq!(first.session_key, None);
        assert_eq!(first.status, TaskStatus::Review);
        let holder = store
            .find_by_session_key_sync("gw", "agent:writer:main")
            .expect("find")
            .expect("holder");
        assert_eq!(holder.id, second);

        let again = store
            .bind_session_sync(&second, "agent:writer:main", None)
            .expect("rebind same task");
        assert_eq!(again.released_from, None);
        assert_eq!(again.task.run_id.as_deref(), Some("run-2"));
    }

    #[test]
    fn binding_rejects_blank_key_and_missing_task() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let id = store.create_task_sync(new_task("gw", "Blank")).expect("create");
        assert!(matches!(
            store.bind_session_sync(&id, "  ", None),
            Err(StorageError::Invalid(_))
        ));
        assert!(matches!(
            store.bind_session_sync("missing", "agent:a:main", None),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn documents_link_to_tasks_and_outlive_them() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let task_id = store
            .create_task_sync(new_task("gw", "Write report"))
            .expect("create");
        let document = store
            .create_document_sync(NewDocument {
                gateway_id: "gw".to_string(),
                task_id: Some(task_id.clone()),
                title: " Q3 report ".to_string(),
                content: "draft".to_string(),
                kind: None,
            })
            .expect("document");
        assert_eq!(document.title, "Q3 report");
        assert_eq!(document.kind, DEFAULT_DOCUMENT_KIND);
        assert!(store
            .list_activities_sync("gw", 1)
            .expect("activities")
            .iter()
            .any(|activity| activity.kind == activity_kind::DOCUMENT_CREATED));

        let updated = store
            .update_document_sync(
                &document.id,
                DocumentPatch {
                    content: Some("final".to_string()),
                    kind: Some("report".to_string()),
                    ..DocumentPatch::default()
                },
            )
            .expect("update");
        assert_eq!(updated.content, "final");
        assert_eq!(updated.title, "Q3 report");
        assert!(updated.updated_at >= document.updated_at);

        store.delete_task_sync(&task_id).expect("delete task");
        let orphan = store
            .get_document_sync(&document.id)
            .expect("get")
            .expect("document survives");
        assert_eq!(orphan.task_id, None);

        store.delete_document_sync(&document.id).expect("delete");
        assert!(store.list_documents_sync("gw").expect("list").is_empty());
        assert!(matches!(
            store.delete_document_sync(&document.id),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn documents_reject_foreign_tasks_and_blank_titles() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let other = store
            .create_task_sync(new_task("gw-2", "Not yours"))
            .expect("create");
        let err = store
            .create_document_sync(NewDocument {
                gateway_id: "gw".to_string(),
                task_id: Some(other),
                title: "Spec".to_string(),
                ..NewDocument::default()
            })
            .expect_err("foreign task");
        assert!(matches!(err, StorageError::NotFound(_)));

        let err = store
            .create_document_sync(NewDocument {
                gateway_id: "gw".to_string(),
                title: "   ".to_string(),
                ..NewDocument::default()
            })
            .expect_err("blank title");
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[test]
    fn journal_lists_newest_first_with_limit() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        for (content, mood) in [("one", None), ("two", Some("calm")), ("three", Some(""))] {
            store
                .add_journal_entry_sync(NewJournalEntry {
                    gateway_id: "gw".to_string(),
                    content: content.to_string(),
                    mood: mood.map(str::to_string),
                    tags: vec!["ops".to_string()],
                })
                .expect("add");
        }
        let entries = store.list_journal_sync("gw", 2).expect("list");
        let contents: Vec<&str> = entries.iter().map(|entry| entry.content.as_str()).collect();
        assert_eq!(contents, vec!["three", "two"]);
        assert_eq!(entries[0].mood, None);
        assert_eq!(entries[1].mood.as_deref(), Some("calm"));
        assert_eq!(entries[1].tags, vec!["ops".to_string()]);

        store.delete_journal_entry_sync(&entries[0].id).expect("delete");
        assert_eq!(store.list_journal_sync("gw", 10).expect("list").len(), 2);
        assert!(matches!(
            store.add_journal_entry_sync(NewJournalEntry {
                gateway_id: "gw".to_string(),
                content: " ".to_string(),
                ..NewJournalEntry::default()
            }),
            Err(StorageError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn trait_surface_maps_errors() {
        let store = SqliteTaskStore::open_in_memory().expect("open db");
        let id = store
            .create_task(new_task("gw", "Via trait"))
            .await
            .expect("create");
        let found = store.list_tasks("gw").await.expect("list");
        assert_eq!(found[0].id, id);
        let err = store
            .bind_session(&id, "", None)
            .await
            .expect_err("blank key");
        assert!(matches!(err, StoreError::Invalid(_)));
        let err = store
            .append_comment(NewComment {
                task_id: "missing".to_string(),
                content: "x".to_string(),
                from_agent: None,
            })
            .await
            .expect_err("missing task");
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
