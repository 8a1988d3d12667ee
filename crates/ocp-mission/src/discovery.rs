//! Session discovery: turns agent sessions that have no task yet into tasks.
//!
//! Chat events and periodic listings both feed one [`DiscoveryTable`]; a pass
//! drains it. The processed set only saves round trips. The store's
//! session-key uniqueness decides whether a second task can exist.

use crate::watcher::{record_completion, Completion, CompletionReason, WatcherTable};
use crate::MissionContext;
use chrono::{DateTime, Utc};
use ocp_core::chat::{excerpt, has_completion_marker};
use ocp_core::session::{agent_from_session_key, infer_channel, infer_source, is_agent_session};
use ocp_core::store::NewTask;
use ocp_core::{ChatHistory, SessionDescriptor, Task, TaskStatus};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PLACEHOLDER_TITLE: &str = "New Session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Delta,
    Final,
}

impl ChatState {
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "delta" => Some(ChatState::Delta),
            "final" => Some(ChatState::Final),
            _ => None,
        }
    }
}

/// Session key and state of a `chat` event payload, if it is one discovery cares about.
pub fn parse_chat_event(payload: &Value) -> Option<(String, ChatState)> {
    let key = payload
        .get("sessionKey")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|key| !key.is_empty())?;
    let state = payload
        .get("state")
        .and_then(Value::as_str)
        .and_then(ChatState::parse)?;
    Some((key.to_string(), state))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionActivity {
    pub session_key: String,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub delta_count: u32,
    pub is_final: bool,
    pub from_poll: bool,
    pub channel: Option<String>,
    pub spawned_by: Option<String>,
    pub derived_title: Option<String>,
}

impl SessionActivity {
    fn new(session_key: &str, now: Instant) -> Self {
        Self {
            session_key: session_key.to_string(),
            first_seen: now,
            last_seen: now,
            delta_count: 0,
            is_final: false,
            from_poll: false,
            channel: None,
            spawned_by: None,
            derived_title: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryTable {
    processed: HashSet<String>,
    active: HashMap<String, SessionActivity>,
}

impl DiscoveryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_chat(&mut self, session_key: &str, state: ChatState, now: Instant) {
        let entry = self
            .active
            .entry(session_key.to_string())
            .or_insert_with(|| SessionActivity::new(session_key, now));
        entry.last_seen = now;
        match state {
            ChatState::Delta => entry.delta_count += 1,
            ChatState::Final => entry.is_final = true,
        }
    }

    /// Adds recent, unbound agent sessions from a listing. Returns how many were added.
    pub fn observe_listing(
        &mut self,
        sessions: &[SessionDescriptor],
        bound: &HashSet<String>,
        wall_now: DateTime<Utc>,
        window: Duration,
        now: Instant,
    ) -> usize {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(1));
        let mut added = 0;
        for session in sessions {
            let key = session.key.as_str();
            if !is_agent_session(key)
                || bound.contains(key)
                || self.processed.contains(key)
                || self.active.contains_key(key)
                || !session.is_recent(wall_now, window)
            {
                continue;
            }
            let mut entry = SessionActivity::new(key, now);
            entry.from_poll = true;
            entry.channel = session.channel.clone();
            entry.spawned_by = session.spawned_by.clone();
            entry.derived_title = session.derived_title.clone();
            self.active.insert(key.to_string(), entry);
            added += 1;
        }
        added
    }

    /// Pending entries, oldest first.
    pub fn candidates(&self) -> Vec<SessionActivity> {
        let mut entries: Vec<SessionActivity> = self.active.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.session_key.cmp(&b.session_key))
        });
        entries
    }

    pub fn is_processed(&self, session_key: &str) -> bool {
        self.processed.contains(session_key)
    }

    pub fn mark_processed(&mut self, session_key: &str) -> bool {
        self.processed.insert(session_key.to_string())
    }

    pub fn settle(&mut self, session_key: &str) {
        self.active.remove(session_key);
    }

    pub fn pending(&self) -> usize {
        self.active.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Ids returned by the store for new sessions. A duplicate create resolves
    /// to the id of the task that already holds the key.
    pub created: Vec<String>,
    pub completed: Vec<String>,
    pub skipped: usize,
}

/// Title for a discovered session: the gateway's own title unless it is the
/// placeholder, else the first user message on one line, else a generic label.
pub fn build_task_title(
    derived_title: Option<&str>,
    first_user_text: Option<&str>,
    agent_id: &str,
    max_chars: usize,
) -> String {
    if let Some(title) = derived_title
        .map(str::trim)
        .filter(|title| !title.is_empty() && *title != PLACEHOLDER_TITLE)
    {
        return title.to_string();
    }
    if let Some(text) = first_user_text {
        let line = text.replace(['\r', '\n'], " ");
        let line = line.trim();
        if !line.is_empty() {
            if line.chars().count() > max_chars {
                let head: String = line.chars().take(max_chars.saturating_sub(3)).collect();
                return format!("{head}…");
            }
            return line.to_string();
        }
    }
    format!("Task for {agent_id}")
}

pub fn build_discovered_task(
    ctx: &MissionContext,
    candidate: &SessionActivity,
    history: &ChatHistory,
) -> NewTask {
    let key = candidate.session_key.as_str();
    let agent_id = agent_from_session_key(key);
    let first_user = history.first_user_text();
    let derived = history
        .derived_title
        .as_deref()
        .or(candidate.derived_title.as_deref());
    let channel_hint = candidate.channel.as_deref();
    NewTask {
        gateway_id: ctx.config.gateway_id.clone(),
        title: build_task_title(derived, first_user.as_deref(), &agent_id, ctx.config.title_chars),
        description: first_user
            .as_deref()
            .map(|text| excerpt(text, ctx.config.excerpt_chars))
            .unwrap_or_default(),
        assignee_ids: vec![agent_id],
        session_key: Some(key.to_string()),
        source: infer_source(channel_hint, key),
        channel: infer_channel(channel_hint, key).map(|channel| channel.as_str().to_string()),
        spawned_by: candidate.spawned_by.clone(),
    }
}

/// Marker-only completion check for a bound task. Returns true when the task
/// was moved to review.
async fn check_completion(ctx: &MissionContext, task: &Task, session_key: &str) -> bool {
    let Some(history) = ctx
        .gateway
        .chat_history(session_key, ctx.config.completion_history_limit)
        .await
    else {
        return false;
    };
    let Some(text) = history.last_assistant().map(|message| message.text()) else {
        return false;
    };
    if !has_completion_marker(&text) {
        return false;
    }
    let agent_id = task
        .primary_assignee()
        .map(str::to_string)
        .unwrap_or_else(|| agent_from_session_key(session_key));
    let completion = Completion {
        reason: CompletionReason::Marker,
        excerpt: excerpt(&text, ctx.config.excerpt_chars),
    };
    match record_completion(ctx, &task.id, &agent_id, &completion).await {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(err) => {
            warn!("discovery_completion_failed: task={} {err}", task.id);
            false
        }
    }
}

/// Drains the table once.
pub async fn run_pass(
    table: &mut DiscoveryTable,
    ctx: &MissionContext,
    watchers: &WatcherTable,
) -> PassReport {
    let mut report = PassReport::default();
    if !ctx.gateway.is_connected() || table.pending() == 0 {
        return report;
    }
    let tasks = match ctx.store.list_tasks(&ctx.config.gateway_id).await {
        Ok(tasks) => tasks,
        Err(err) => {
            warn!("discovery_list_tasks_failed: {err}");
            return report;
        }
    };
    let bound: HashMap<&str, &Task> = tasks
        .iter()
        .filter_map(|task| task.session_key().map(|key| (key, task)))
        .collect();

    for candidate in table.candidates() {
        let key = candidate.session_key.as_str();

        if let Some(task) = bound.get(key) {
            table.settle(key);
            if task.status == TaskStatus::InProgress
                && (candidate.is_final || candidate.from_poll)
                && !watchers.is_active(&task.id)
                && check_completion(ctx, task, key).await
            {
                report.completed.push(task.id.clone());
            }
            continue;
        }

        if table.is_processed(key) || !is_agent_session(key) {
            table.settle(key);
            report.skipped += 1;
            continue;
        }

        let Some(history) = ctx
            .gateway
            .chat_history(key, ctx.config.probe_history_limit)
            .await
        else {
            debug!("discovery_history_unavailable: session={key}");
            continue;
        };
        if history.messages.is_empty() {
            table.settle(key);
            report.skipped += 1;
            continue;
        }

        let new_task = build_discovered_task(ctx, &candidate, &history);
        table.mark_processed(key);
        table.settle(key);
        match ctx.store.create_task(new_task).await {
            Ok(task_id) => {
                info!("discovery_task_created: task={} session={}", task_id, key);
                report.created.push(task_id);
            }
            Err(err) => warn!("discovery_create_failed: session={} {err}", key),
        }
    }
    report
}
