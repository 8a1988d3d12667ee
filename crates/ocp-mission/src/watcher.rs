//! Per-task completion watchers.
//!
//! A watcher polls one session's history on a fixed interval and moves its
//! task to `review` once the agent signals completion with a marker or goes
//! idle. [`WatchState`] holds the decision logic and has no I/O; the table
//! owns the spawned loops, keyed by task id.

use crate::MissionContext;
use ocp_core::chat::{excerpt, has_completion_marker};
use ocp_core::session::agent_from_session_key;
use ocp_core::store::{activity_kind, NewActivity, NewComment, TaskPatch};
use ocp_core::{ChatHistory, ChatRole, StoreError, Task, TaskStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Marker,
    Idle,
}

impl CompletionReason {
    pub fn activity_kind(&self) -> &'static str {
        match self {
            CompletionReason::Marker => activity_kind::TASK_COMPLETED,
            CompletionReason::Idle => activity_kind::TASK_IDLE_REVIEW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub reason: CompletionReason,
    /// Truncated text of the newest assistant message.
    pub excerpt: String,
}

#[derive(Debug, Clone)]
pub struct WatchState {
    pub task_id: String,
    pub session_key: String,
    pub agent_id: String,
    last_count: usize,
    last_text: Option<String>,
    idle_since: Instant,
    baseline: Option<Baseline>,
}

/// What the session looked like before the task was sent. Assistant
/// messages already present then belong to earlier work.
#[derive(Debug, Clone)]
struct Baseline {
    count: usize,
    assistant_text: Option<String>,
}

impl WatchState {
    pub fn new(task: &Task, session_key: &str, now: Instant) -> Self {
        let agent_id = task
            .primary_assignee()
            .map(str::to_string)
            .unwrap_or_else(|| agent_from_session_key(session_key));
        Self {
            task_id: task.id.clone(),
            session_key: session_key.to_string(),
            agent_id,
            last_count: 0,
            last_text: None,
            idle_since: now,
            baseline: None,
        }
    }

    /// Ignores the assistant replies already in `history` until a newer one
    /// arrives.
    pub fn with_baseline(mut self, history: &ChatHistory) -> Self {
        self.last_count = history.messages.len();
        self.last_text = history.messages.last().map(|message| message.text());
        self.baseline = Some(Baseline {
            count: history.messages.len(),
            assistant_text: history.last_assistant().map(|message| message.text()),
        });
        self
    }

    /// Whether the newest assistant message arrived after the baseline. Clears
    /// the baseline once it has.
    fn has_fresh_reply(&mut self, history: &ChatHistory) -> bool {
        let Some(baseline) = self.baseline.as_ref() else {
            return true;
        };
        let Some(index) = history
            .messages
            .iter()
            .rposition(|message| message.role == ChatRole::Assistant)
        else {
            return false;
        };
        let text = history.messages[index].text();
        let fresh = baseline.assistant_text.as_deref() != Some(text.as_str())
            || (history.messages.len() > baseline.count && index >= baseline.count);
        if fresh {
            self.baseline = None;
        }
        fresh
    }

    /// Folds one history snapshot into the state.
    ///
    /// The marker check looks only at the newest assistant message, and only
    /// once that message is newer than the baseline. Any change in message
    /// count or in the newest message counts as growth and restarts the idle
    /// clock, so a history window that stays full still registers activity.
    pub fn observe(
        &mut self,
        history: &ChatHistory,
        now: Instant,
        idle_threshold: Duration,
        excerpt_chars: usize,
    ) -> Option<Completion> {
        let fresh = self.has_fresh_reply(history);
        let last_assistant = history
            .last_assistant()
            .map(|message| message.text())
            .filter(|_| fresh);

        if let Some(text) = last_assistant.as_deref() {
            if has_completion_marker(text) {
                return Some(Completion {
                    reason: CompletionReason::Marker,
                    excerpt: excerpt(text, excerpt_chars),
                });
            }
        }

        let count = history.messages.len();
        let newest = history.messages.last().map(|message| message.text());
        if count != self.last_count || newest != self.last_text {
            self.last_count = count;
            self.last_text = newest;
            self.idle_since = now;
            return None;
        }

        let text = last_assistant?;
        if now.duration_since(self.idle_since) >= idle_threshold {
            return Some(Completion {
                reason: CompletionReason::Idle,
                excerpt: excerpt(&text, excerpt_chars),
            });
        }
        None
    }
}

/// Moves a task to review and records who finished it and why.
///
/// Returns `None` without writing anything when the task is gone or has
/// already left `in_progress`.
pub async fn record_completion(
    ctx: &MissionContext,
    task_id: &str,
    agent_id: &str,
    completion: &Completion,
) -> Result<Option<Task>, StoreError> {
    let current = ctx.store.get_task(task_id).await?;
    if !current.is_some_and(|task| task.status == TaskStatus::InProgress) {
        return Ok(None);
    }
    let task = ctx
        .store
        .patch_task(task_id, TaskPatch::status(TaskStatus::Review))
        .await?;
    if !completion.excerpt.trim().is_empty() {
        ctx.store
            .append_comment(NewComment {
                task_id: task_id.to_string(),
                content: completion.excerpt.clone(),
                from_agent: Some(agent_id.to_string()),
            })
            .await?;
    }
    let message = match completion.reason {
        CompletionReason::Marker => format!("Completed: {}", task.title),
        CompletionReason::Idle => format!("Went idle, moved to review: {}", task.title),
    };
    ctx.store
        .append_activity(NewActivity::new(
            &ctx.config.gateway_id,
            completion.reason.activity_kind(),
            agent_id,
            message,
        ))
        .await?;
    Ok(Some(task))
}

struct ActiveWatcher {
    generation: u64,
    session_key: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Entries {
    next_generation: u64,
    active: HashMap<String, ActiveWatcher>,
}

/// Running watchers keyed by task id.
#[derive(Clone, Default)]
pub struct WatcherTable {
    inner: Arc<Mutex<Entries>>,
}

impl WatcherTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts a watcher for `task`. Returns false when one is already running
    /// or the task has no session key.
    pub fn start(&self, ctx: &MissionContext, task: &Task) -> bool {
        self.start_with_baseline(ctx, task, None)
    }

    /// Like [`WatcherTable::start`], but replies already in `baseline` do
    /// not count toward completion.
    pub fn start_with_baseline(
        &self,
        ctx: &MissionContext,
        task: &Task,
        baseline: Option<&ChatHistory>,
    ) -> bool {
        let Some(session_key) = task.session_key() else {
            return false;
        };
        let mut entries = self.entries();
        if entries.active.contains_key(&task.id) {
            return false;
        }
        entries.next_generation += 1;
        let generation = entries.next_generation;
        let mut state = WatchState::new(task, session_key, Instant::now());
        if let Some(history) = baseline {
            state = state.with_baseline(history);
        }
        let handle = tokio::spawn(run_watcher(ctx.clone(), state, self.clone(), generation));
        entries.active.insert(
            task.id.clone(),
            ActiveWatcher {
                generation,
                session_key: session_key.to_string(),
                handle,
            },
        );
        info!("watcher_started: task={} session={}", task.id, session_key);
        true
    }

    pub fn stop(&self, task_id: &str) -> bool {
        let removed = self.entries().active.remove(task_id);
        match removed {
            Some(watcher) => {
                watcher.handle.abort();
                debug!("watcher_stopped: task={} session={}", task_id, watcher.session_key);
                true
            }
            None => false,
        }
    }

    /// Cancels every watcher and returns how many were running.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<ActiveWatcher> = self.entries().active.drain().map(|(_, w)| w).collect();
        for watcher in &drained {
            watcher.handle.abort();
        }
        drained.len()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.entries().active.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Removes the entry only if it still belongs to the finishing loop.
    fn finish(&self, task_id: &str, generation: u64) {
        let mut entries = self.entries();
        if entries
            .active
            .get(task_id)
            .is_some_and(|watcher| watcher.generation == generation)
        {
            entries.active.remove(task_id);
        }
    }
}

async fn run_watcher(ctx: MissionContext, mut state: WatchState, table: WatcherTable, generation: u64) {
    let period = ctx.config.watcher_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match ctx.store.get_task(&state.task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::InProgress => {}
            Ok(task) => {
                debug!(
                    "watcher_task_settled: task={} status={}",
                    state.task_id,
                    task.map(|task| task.status.as_str()).unwrap_or("deleted")
                );
                break;
            }
            Err(err) => {
                warn!("watcher_task_lookup_failed: task={} {err}", state.task_id);
                continue;
            }
        }
        let Some(history) = ctx
            .gateway
            .chat_history(&state.session_key, ctx.config.watcher_history_limit)
            .await
        else {
            debug!("watcher_history_unavailable: task={} session={}", state.task_id, state.session_key);
            continue;
        };
        let Some(completion) = state.observe(
            &history,
            Instant::now(),
            ctx.config.idle_threshold,
            ctx.config.excerpt_chars,
        ) else {
            continue;
        };

        match record_completion(&ctx, &state.task_id, &state.agent_id, &completion).await {
            Ok(Some(_)) => info!(
                "watcher_completed: task={} reason={:?} agent={}",
                state.task_id, completion.reason, state.agent_id
            ),
            Ok(None) => debug!("watcher_task_settled: task={}", state.task_id),
            Err(err) => warn!("watcher_record_failed: task={} {err}", state.task_id),
        }
        break;
    }

    table.finish(&state.task_id, generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocp_core::ChatMessage;

    fn task() -> Task {
        let now = chrono::Utc::now();
        Task {
            id: "t1".to_string(),
            gateway_id: "gw".to_string(),
            title: "Write changelog".to_string(),
            description: String::new(),
            status: TaskStatus::InProgress,
            assignee_ids: vec!["writer".to_string()],
            session_key: Some("agent:writer:main".to_string()),
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

    fn history(messages: &[(ChatRole, &str)]) -> ChatHistory {
        ChatHistory {
            session_key: Some("agent:writer:main".to_string()),
            messages: messages
                .iter()
                .map(|(role, text)| ChatMessage::new(*role, *text))
                .collect(),
            derived_title: None,
        }
    }

    const IDLE: Duration = Duration::from_secs(30);

    #[test]
    fn marker_in_newest_assistant_message_completes() {
        let start = Instant::now();
        let mut state = WatchState::new(&task(), "agent:writer:main", start);
        let snapshot = history(&[
            (ChatRole::User, "go"),
            (ChatRole::Assistant, "All done [done]"),
        ]);
        let completion = state.observe(&snapshot, start, IDLE, 500).expect("completion");
        assert_eq!(completion.reason, CompletionReason::Marker);
        assert_eq!(completion.excerpt, "All done [done]");
    }

    #[test]
    fn marker_in_older_assistant_message_is_ignored() {
        let start = Instant::now();
        let mut state = WatchState::new(&task(), "agent:writer:main", start);
        let snapshot = history(&[
            (ChatRole::Assistant, "first pass [DONE]"),
            (ChatRole::User, "one more thing"),
            (ChatRole::Assistant, "on it"),
        ]);
        assert_eq!(state.observe(&snapshot, start, IDLE, 500), None);
    }

    #[test]
    fn idle_fires_only_after_threshold_without_growth() {
        let start = Instant::now();
        let mut state = WatchState::new(&task(), "agent:writer:main", start);
        let snapshot = history(&[(ChatRole::User, "go"), (ChatRole::Assistant, "working")]);

        assert_eq!(state.observe(&snapshot, start, IDLE, 500), None);
        assert_eq!(state.observe(&snapshot, start + Duration::from_secs(29), IDLE, 500), None);
        let completion = state
            .observe(&snapshot, start + Duration::from_secs(30), IDLE, 500)
            .expect("idle completion");
        assert_eq!(completion.reason, CompletionReason::Idle);
        assert_eq!(completion.excerpt, "working");
    }

    #[test]
    fn growth_resets_idle_clock() {
        let start = Instant::now();
        let mut state = WatchState::new(&task(), "agent:writer:main", start);
        let first = history(&[(ChatRole::Assistant, "step 1")]);
        let second = history(&[(ChatRole::Assistant, "step 1"), (ChatRole::Assistant, "step 2")]);

        assert_eq!(state.observe(&first, start, IDLE, 500), None);
        assert_eq!(state.observe(&second, start + Duration::from_secs(25), IDLE, 500), None);
        assert_eq!(state.observe(&second, start + Duration::from_secs(50), IDLE, 500), None);
        assert!(state.observe(&second, start + Duration::from_secs(55), IDLE, 500).is_some());
    }

    #[test]
    fn idle_requires_an_assistant_message() {
        let start = Instant::now();
        let mut state = WatchState::new(&task(), "agent:writer:main", start);
        let snapshot = history(&[(ChatRole::User, "hello?")]);
        assert_eq!(state.observe(&snapshot, start, IDLE, 500), None);
        assert_eq!(state.observe(&snapshot, start + Duration::from_secs(120), IDLE, 500), None);
    }

    #[test]
    fn baseline_reply_does_not_complete_new_work() {
        let start = Instant::now();
        let before = history(&[
            (ChatRole::User, "old task"),
            (ChatRole::Assistant, "old work [DONE]"),
        ]);
        let mut state =
            WatchState::new(&task(), "agent:writer:main", start).with_baseline(&before);

        let sent = history(&[
            (ChatRole::User, "old task"),
            (ChatRole::Assistant, "old work [DONE]"),
            (ChatRole::User, "[TASK] Write changelog"),
        ]);
        assert_eq!(state.observe(&sent, start + Duration::from_secs(5), IDLE, 500), None);
        assert_eq!(state.observe(&sent, start + Duration::from_secs(60), IDLE, 500), None);

        let replied = history(&[
            (ChatRole::User, "old task"),
            (ChatRole::Assistant, "old work [DONE]"),
            (ChatRole::User, "[TASK] Write changelog"),
            (ChatRole::Assistant, "changelog written [DONE]"),
        ]);
        let completion = state
            .observe(&replied, start + Duration::from_secs(65), IDLE, 500)
            .expect("completion");
        assert_eq!(completion.reason, CompletionReason::Marker);
        assert_eq!(completion.excerpt, "changelog written [DONE]");
    }

    #[test]
    fn repeated_reply_text_after_baseline_still_counts() {
        let start = Instant::now();
        let before = history(&[(ChatRole::Assistant, "[DONE]")]);
        let mut state =
            WatchState::new(&task(), "agent:writer:main", start).with_baseline(&before);
        let replied = history(&[
            (ChatRole::Assistant, "[DONE]"),
            (ChatRole::User, "[TASK] again"),
            (ChatRole::Assistant, "[DONE]"),
        ]);
        let completion = state.observe(&replied, start, IDLE, 500).expect("completion");
        assert_eq!(completion.reason, CompletionReason::Marker);
    }

    #[test]
    fn excerpt_is_truncated() {
        let start = Instant::now();
        let mut state = WatchState::new(&task(), "agent:writer:main", start);
        let long = format!("{} [DONE]", "x".repeat(600));
        let snapshot = history(&[(ChatRole::Assistant, long.as_str())]);
        let completion = state.observe(&snapshot, start, IDLE, 500).expect("completion");
        assert_eq!(completion.excerpt.chars().count(), 500);
    }
}
