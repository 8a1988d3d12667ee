use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use config::ResolvedGateway;
use ocp_core::TaskStore;
use ocp_storage::SqliteTaskStore;
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod document;
mod journal;
mod logging;
mod remote;
mod task;

#[derive(Parser)]
#[command(name = "ocp")]
#[command(about = "OpenClaw ControlPane CLI", long_about = None)]
struct Cli {
    /// SQLite database path (overrides OCP_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Registered gateway name (overrides OCP_GATEWAY and the selected gateway).
    #[arg(long, short = 'g', global = true)]
    gateway: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Manage registered gateways
    Gateway {
        #[command(subcommand)]
        action: GatewayCommand,
    },
    /// Print the gateway health payload
    Health,
    /// List gateway sessions
    Sessions(remote::SessionsArgs),
    /// Call any remote method and print the result
    Call(remote::CallArgs),
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: task::TaskCommand,
    },
    /// Manage deliverable documents
    Doc {
        #[command(subcommand)]
        action: document::DocCommand,
    },
    /// Keep a per-gateway journal
    Journal {
        #[command(subcommand)]
        action: journal::JournalCommand,
    },
    /// Show recent activity
    Activity(ActivityArgs),
    /// Show @mention notifications
    Notifications(NotificationArgs),
    /// Run session discovery and completion watchers until Ctrl-C
    Watch(remote::WatchArgs),
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum GatewayCommand {
    Add(GatewayAddArgs),
    #[command(alias = "ls")]
    List,
    #[command(alias = "rm")]
    Remove(GatewayRemoveArgs),
    Select(GatewayNameArgs),
}

#[derive(Args, Debug)]
struct GatewayAddArgs {
    name: String,
    url: String,
    #[arg(long)]
    token: Option<String>,
}

#[derive(Args, Debug)]
struct GatewayRemoveArgs {
    name: String,
    /// Also delete every record scoped to the gateway: tasks, comments,
    /// activities, notifications, documents and journal entries.
    #[arg(long)]
    purge: bool,
}

#[derive(Args, Debug)]
struct GatewayNameArgs {
    name: String,
}

#[derive(Args, Debug)]
struct ActivityArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Args, Debug)]
struct NotificationArgs {
    /// Include delivered notifications.
    #[arg(long)]
    all: bool,
    /// Mark the listed notifications delivered.
    #[arg(long)]
    ack: bool,
}

/// Per-invocation handles shared by every command.
pub struct Context {
    pub store: Arc<SqliteTaskStore>,
    gateway_flag: Option<String>,
}

impl Context {
    pub fn gateway(&self) -> Result<ResolvedGateway> {
        config::resolve_gateway(&self.store, self.gateway_flag.as_deref())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if matches!(cli.command, Commands::Watch(_)) {
        "info"
    } else {
        "warn"
    };
    let _log_guard = logging::init_logging(default_level);

    let db_path = config::resolve_db_path(cli.db)?;
    let ctx = Context {
        store: Arc::new(config::open_store(&db_path)?),
        gateway_flag: cli.gateway,
    };

    match cli.command {
        Commands::Gateway { action } => handle_gateway_command(&ctx, action)?,
        Commands::Health => remote::health(&ctx).await?,
        Commands::Sessions(args) => remote::sessions(&ctx, args).await?,
        Commands::Call(args) => remote::call(&ctx, args).await?,
        Commands::Task { action } => task::handle_task_command(&ctx, action).await?,
        Commands::Doc { action } => document::handle_doc_command(&ctx, action).await?,
        Commands::Journal { action } => journal::handle_journal_command(&ctx, action).await?,
        Commands::Activity(args) => {
            let gateway = ctx.gateway()?;
            for activity in ctx.store.list_activities(&gateway.id, args.limit).await? {
                println!(
                    "{} {:<20} {:<12} {}",
                    activity.created_at.format("%Y-%m-%d %H:%M:%S"),
                    activity.kind,
                    activity.agent_name,
                    activity.message
                );
            }
        }
        Commands::Notifications(args) => {
            let gateway = ctx.gateway()?;
            let notifications = ctx.store.list_notifications(&gateway.id, !args.all).await?;
            if notifications.is_empty() {
                println!("No notifications");
            }
            for notification in notifications {
                let marker = if notification.delivered { " " } else { "*" };
                println!(
                    "{marker} @{} {}",
                    notification.agent_name, notification.content
                );
                if args.ack && !notification.delivered {
                    ctx.store
                        .mark_notification_delivered(&notification.id)
                        .await?;
                }
            }
        }
        Commands::Watch(args) => remote::watch(&ctx, args).await?,
    }

    Ok(())
}

fn handle_gateway_command(ctx: &Context, action: GatewayCommand) -> Result<()> {
    match action {
        GatewayCommand::Add(args) => {
            if args.url.trim().is_empty() {
                bail!("Gateway url is required");
            }
            let config = ctx
                .store
                .add_gateway(&args.name, &args.url, args.token.as_deref())?;
            let selected = if config.selected { " (selected)" } else { "" };
            println!("Added gateway {} -> {}{selected}", config.name, config.url);
        }
        GatewayCommand::List => {
            let gateways = ctx.store.list_gateways()?;
            if gateways.is_empty() {
                println!("No gateways registered");
            }
            for gateway in gateways {
                let marker = if gateway.selected { "*" } else { " " };
                let auth = if gateway.token.is_some() { " [token]" } else { "" };
                println!("{marker} {}  {}{auth}", gateway.name, gateway.url);
            }
        }
        GatewayCommand::Remove(args) => {
            let (config, report) = ctx.store.remove_gateway(&args.name, args.purge)?;
            println!("Removed gateway {}", config.name);
            if args.purge {
                println!(
                    "Purged {} tasks, {} comments, {} activities, {} notifications, \
                     {} documents, {} journal entries",
                    report.tasks,
                    report.comments,
                    report.activities,
                    report.notifications,
                    report.documents,
                    report.journal_entries
                );
            }
        }
        GatewayCommand::Select(args) => {
            let config = ctx.store.select_gateway(&args.name)?;
            println!("Selected gateway {}", config.name);
        }
    }
    Ok(())
}
