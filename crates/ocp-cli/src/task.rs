use crate::remote;
use crate::Context as AppContext;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use ocp_core::store::{NewComment, NewTask, TaskPatch};
use ocp_core::session::MANUAL_SOURCE;
use ocp_core::{Task, TaskStatus, TaskStore};
use ocp_mission::{MissionConfig, MissionControl};
use std::sync::Arc;

const SHORT_ID_LEN: usize = 8;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum TaskCommand {
    Add(TaskAddArgs),
    #[command(alias = "ls")]
    List(TaskListArgs),
    Show(TaskTargetArgs),
    #[command(alias = "status")]
    Move(TaskMoveArgs),
    Archive(TaskTargetArgs),
    #[command(alias = "rm")]
    Delete(TaskTargetArgs),
    Comment(TaskCommentArgs),
    Dispatch(TaskDispatchArgs),
    Tail(TaskTailArgs),
}

#[derive(Args, Debug)]
pub struct TaskAddArgs {
    pub title: String,
    #[arg(long, alias = "desc")]
    pub description: Option<String>,
    /// Agent id to assign; repeat for several.
    #[arg(long = "assign")]
    pub assignees: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TaskListArgs {
    #[arg(long)]
    pub status: Option<TaskStatus>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct TaskTargetArgs {
    /// Task id or unique prefix.
    pub id: String,
}

#[derive(Args, Debug)]
pub struct TaskMoveArgs {
    pub id: String,
    pub status: TaskStatus,
}

#[derive(Args, Debug)]
pub struct TaskCommentArgs {
    pub id: String,
    pub text: String,
    /// Author name; defaults to the operator.
    #[arg(long)]
    pub from: Option<String>,
}

#[derive(Args, Debug)]
pub struct TaskDispatchArgs {
    pub id: String,
    /// Keep running until the dispatched task leaves `in_progress`.
    #[arg(long)]
    pub follow: bool,
}

#[derive(Args, Debug)]
pub struct TaskTailArgs {
    pub id: String,
    #[arg(long)]
    pub json: bool,
}

pub async fn handle_task_command(ctx: &AppContext, command: TaskCommand) -> Result<()> {
    let gateway = ctx.gateway()?;
    let store = ctx.store.clone();
    match command {
        TaskCommand::Add(args) => {
            let assignees: Vec<String> = args
                .assignees
                .iter()
                .map(|agent| agent.trim().to_string())
                .filter(|agent| !agent.is_empty())
                .collect();
            let id = store
                .create_task(NewTask {
                    gateway_id: gateway.id.clone(),
                    title: args.title.trim().to_string(),
                    description: args.description.unwrap_or_default(),
                    assignee_ids: assignees,
                    source: MANUAL_SOURCE.to_string(),
                    ..NewTask::default()
                })
                .await?;
            let task = load(&*store, &id).await?;
            println!("Created [{}] {} ({})", short_id(&task.id), task.title, task.status);
        }
        TaskCommand::List(args) => {
            let mut tasks = store.list_tasks(&gateway.id).await?;
            if let Some(status) = args.status {
                tasks.retain(|task| task.status == status);
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }
            if tasks.is_empty() {
                println!("No tasks for gateway {}", gateway.name);
                return Ok(());
            }
            for status in TaskStatus::ALL {
                let column: Vec<&Task> = tasks.iter().filter(|task| task.status == status).collect();
                if column.is_empty() {
                    continue;
                }
                println!("{} ({})", status, column.len());
                for task in column {
                    println!("  {}", task_line(task));
                }
            }
        }
        TaskCommand::Show(args) => {
            let task = find_task(&*store, &gateway.id, &args.id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            let comments = store.list_comments(&task.id).await?;
            if !comments.is_empty() {
                println!("Comments:");
                for comment in comments {
                    println!(
                        "  {} {}: {}",
                        comment.created_at.format("%Y-%m-%d %H:%M"),
                        comment.from_agent,
                        comment.content
                    );
                }
            }
        }
        TaskCommand::Move(args) => {
            let task = find_task(&*store, &gateway.id, &args.id).await?;
            let updated = store
                .patch_task(&task.id, TaskPatch::status(args.status))
                .await?;
            println!("[{}] {} -> {}", short_id(&updated.id), task.status, updated.status);
        }
        TaskCommand::Archive(args) => {
            let task = find_task(&*store, &gateway.id, &args.id).await?;
            let archived = store.archive_task(&task.id).await?;
            println!("Archived [{}] {}", short_id(&archived.id), archived.title);
        }
        TaskCommand::Delete(args) => {
            let task = find_task(&*store, &gateway.id, &args.id).await?;
            store.delete_task(&task.id).await?;
            println!("Deleted [{}] {}", short_id(&task.id), task.title);
        }
        TaskCommand::Comment(args) => {
            let task = find_task(&*store, &gateway.id, &args.id).await?;
            let comment = store
                .append_comment(NewComment {
                    task_id: task.id.clone(),
                    content: args.text,
                    from_agent: args.from,
                })
                .await?;
            println!("Comment added to [{}] by {}", short_id(&task.id), comment.from_agent);
        }
        TaskCommand::Dispatch(args) => {
            let task = find_task(&*store, &gateway.id, &args.id).await?;
            let facade = remote::connect(&gateway).await?;
            let mission = MissionControl::new(
                MissionConfig::new(gateway.id.clone()),
                Arc::new(facade.clone()),
                store.clone(),
            );
            let outcome = mission.dispatch_task(&task).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if args.follow && outcome.success {
                follow_until_settled(&*store, &mission, &task.id).await?;
            }
            mission.stop_all_watchers();
            facade.client().disconnect();
            if !outcome.success {
                bail!(
                    "Dispatch failed: {}",
                    outcome.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }
        TaskCommand::Tail(args) => {
            let task = find_task(&*store, &gateway.id, &args.id).await?;
            let session_key = task
                .session_key()
                .map(str::to_string)
                .unwrap_or_default();
            let facade = remote::connect(&gateway).await?;
            let mission = MissionControl::new(
                MissionConfig::new(gateway.id.clone()),
                Arc::new(facade.clone()),
                store.clone(),
            );
            let messages = mission
                .tail_session(&session_key, task.primary_assignee())
                .await;
            facade.client().disconnect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
                return Ok(());
            }
            for message in messages {
                println!("[{}] {}", message.role.as_str(), message.text);
            }
        }
    }
    Ok(())
}

async fn follow_until_settled(
    store: &dyn TaskStore,
    mission: &MissionControl,
    task_id: &str,
) -> Result<()> {
    let period = mission.config().watcher_interval;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(period) => {}
        }
        let task = load(store, task_id).await?;
        if task.status != TaskStatus::InProgress {
            println!("[{}] now {}", short_id(task_id), task.status);
            return Ok(());
        }
    }
}

async fn load(store: &dyn TaskStore, task_id: &str) -> Result<Task> {
    store
        .get_task(task_id)
        .await?
        .ok_or_else(|| anyhow!("Task not found: {task_id}"))
}

/// Resolves a full id or a unique prefix within one gateway.
pub async fn find_task(store: &dyn TaskStore, gateway_id: &str, id: &str) -> Result<Task> {
    let id = id.trim();
    if id.is_empty() {
        bail!("Task id is required");
    }
    let tasks = store
        .list_tasks(gateway_id)
        .await
        .context("Failed to list tasks")?;
    if let Some(task) = tasks.iter().find(|task| task.id == id) {
        return Ok(task.clone());
    }
    let mut matches = tasks.into_iter().filter(|task| task.id.starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(task), None) => Ok(task),
        (Some(_), Some(_)) => bail!("Task id prefix is ambiguous: {id}"),
        (None, _) => bail!("Task not found: {id}"),
    }
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((index, _)) => &id[..index],
        None => id,
    }
}

fn task_line(task: &Task) -> String {
    let mut line = format!("[{}] {}", short_id(&task.id), task.title);
    if !task.assignee_ids.is_empty() {
        line.push_str(&format!(" @{}", task.assignee_ids.join(" @")));
    }
    if let Some(key) = task.session_key() {
        line.push_str(&format!(" <{key}>"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocp_storage::SqliteTaskStore;

    fn new_task(title: &str) -> NewTask {
        NewTask {
            gateway_id: "gw".to_string(),
            title: title.to_string(),
            source: MANUAL_SOURCE.to_string(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn find_task_accepts_full_id_and_unique_prefix() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let id = store.create_task(new_task("one")).await.expect("create");

        assert_eq!(find_task(&store, "gw", &id).await.expect("full").id, id);
        assert_eq!(find_task(&store, "gw", &id[..6]).await.expect("prefix").id, id);
        assert!(find_task(&store, "other", &id).await.is_err());
        assert!(find_task(&store, "gw", "zzzz-not-there").await.is_err());
    }

    #[tokio::test]
    async fn find_task_rejects_blank_id() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        store.create_task(new_task("one")).await.expect("create");
        assert!(find_task(&store, "gw", "  ").await.is_err());
    }

    #[test]
    fn short_id_truncates_to_eight_chars() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
