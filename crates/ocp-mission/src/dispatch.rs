use crate::error::MissionError;
use crate::MissionContext;
use ocp_core::store::{activity_kind, NewActivity, TaskPatch};
use ocp_core::{canonical_session_key, ChatHistory, NormalizedMessage, Task, TaskStatus};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Task that held the session key before this dispatch took it over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_task_id: Option<String>,
}

/// Everything a dispatch produced.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub outcome: DispatchOutcome,
    /// The task as persisted afterwards.
    pub task: Task,
    /// Session history read just before the instruction was sent.
    pub baseline: Option<ChatHistory>,
}

/// Instruction sent to the agent for a task.
pub fn compose_instruction(task: &Task) -> String {
    let mut message = format!("[TASK] {}", task.title);
    let description = task.description.trim();
    if !description.is_empty() {
        message.push_str("\n\nDescription: ");
        message.push_str(description);
    }
    message.push_str(
        "\n\nPlease work on this task and report your progress. \
         When you are finished, reply with [DONE].",
    );
    message
}

/// Sends `task` to its assignee and records the result.
///
/// A failed send still moves the task to `in_progress` and is reported through
/// `success: false`, not as an error. Once the gateway has accepted the
/// instruction, a store failure is also written as a `task_dispatch_error`
/// activity before it is returned.
pub async fn dispatch(ctx: &MissionContext, task: &Task) -> Result<Dispatched, MissionError> {
    if !ctx.gateway.is_connected() {
        return Err(MissionError::NotConnected);
    }
    let agent_id = task
        .primary_assignee()
        .ok_or_else(|| MissionError::NoAssignee(task.id.clone()))?
        .to_string();
    let session_key = task
        .session_key()
        .map(str::to_string)
        .unwrap_or_else(|| canonical_session_key(&agent_id));
    let gateway_id = &ctx.config.gateway_id;

    let baseline = ctx
        .gateway
        .chat_history(&session_key, ctx.config.watcher_history_limit)
        .await;

    match ctx
        .gateway
        .send_to_session(&compose_instruction(task), &session_key)
        .await
    {
        Ok(accepted) => {
            let binding = match ctx
                .store
                .bind_session(&task.id, &session_key, accepted.run_id.clone())
                .await
            {
                Ok(binding) => binding,
                Err(err) => {
                    warn!(
                        "task_dispatch_bind_failed: task={} session={session_key} {err}",
                        task.id
                    );
                    let recorded = ctx
                        .store
                        .append_activity(NewActivity::new(
                            gateway_id,
                            activity_kind::TASK_DISPATCH_ERROR,
                            &agent_id,
                            format!(
                                "Sent \"{}\" to {session_key} but could not record it: {err}",
                                task.title
                            ),
                        ))
                        .await;
                    if let Err(record_err) = recorded {
                        warn!("task_dispatch_error_unrecorded: task={} {record_err}", task.id);
                    }
                    return Err(err.into());
                }
            };
            if let Some(previous) = binding.released_from.as_deref() {
                info!(
                    "task_session_rebound: session={} from={} to={}",
                    session_key, previous, task.id
                );
            }
            ctx.store
                .append_activity(NewActivity::new(
                    gateway_id,
                    activity_kind::TASK_DISPATCHED,
                    &agent_id,
                    format!("Started working on: {}", task.title),
                ))
                .await?;
            info!(
                "task_dispatched: task={} session={} run={}",
                task.id,
                session_key,
                accepted.run_id.as_deref().unwrap_or("-")
            );
            if ctx.config.wait_for_run {
                if let Some(run_id) = accepted.run_id.clone() {
                    spawn_run_logger(ctx, run_id);
                }
            }
            Ok(Dispatched {
                outcome: DispatchOutcome {
                    session_key,
                    run_id: accepted.run_id,
                    success: true,
                    error: None,
                    released_task_id: binding.released_from,
                },
                task: binding.task,
                baseline,
            })
        }
        Err(err) => {
            warn!("task_dispatch_error: task={} {err}", task.id);
            let updated = ctx
                .store
                .patch_task(&task.id, TaskPatch::status(TaskStatus::InProgress))
                .await?;
            ctx.store
                .append_activity(NewActivity::new(
                    gateway_id,
                    activity_kind::TASK_DISPATCH_ERROR,
                    &agent_id,
                    format!("Error dispatching \"{}\": {err}", task.title),
                ))
                .await?;
            Ok(Dispatched {
                outcome: DispatchOutcome {
                    session_key,
                    run_id: None,
                    success: false,
                    error: Some(err.to_string()),
                    released_task_id: None,
                },
                task: updated,
                baseline: None,
            })
        }
    }
}

fn spawn_run_logger(ctx: &MissionContext, run_id: String) {
    let gateway = ctx.gateway.clone();
    let timeout = ctx.config.agent_wait_timeout;
    tokio::spawn(async move {
        match gateway.agent_wait(&run_id, timeout).await {
            Some(outcome) => info!(
                "agent_run_finished: run={} status={}",
                run_id,
                outcome.status.as_deref().unwrap_or("unknown")
            ),
            None => info!("agent_run_unresolved: run={run_id}"),
        }
    });
}

/// Newest messages of a session as role/text pairs. Empty when the history
/// cannot be fetched.
pub async fn tail_session(
    ctx: &MissionContext,
    session_key: &str,
    limit: usize,
) -> Vec<NormalizedMessage> {
    ctx.gateway
        .chat_history(session_key, limit)
        .await
        .map(|history| history.messages.iter().map(NormalizedMessage::from).collect())
        .unwrap_or_default()
}
