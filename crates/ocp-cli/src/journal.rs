use crate::task::short_id;
use crate::Context as AppContext;
use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use ocp_core::store::{JournalEntry, NewJournalEntry};
use ocp_core::TaskStore;

const LOOKUP_LIMIT: usize = 500;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum JournalCommand {
    Add(JournalAddArgs),
    #[command(alias = "ls")]
    List(JournalListArgs),
    #[command(alias = "rm")]
    Delete(JournalTargetArgs),
}

#[derive(Args, Debug)]
pub struct JournalAddArgs {
    pub content: String,
    #[arg(long)]
    pub mood: Option<String>,
    /// Tag the entry; repeat for several.
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Args, Debug)]
pub struct JournalListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct JournalTargetArgs {
    /// Entry id or unique prefix.
    pub id: String,
}

pub async fn handle_journal_command(ctx: &AppContext, command: JournalCommand) -> Result<()> {
    let gateway = ctx.gateway()?;
    let store = ctx.store.clone();
    match command {
        JournalCommand::Add(args) => {
            let tags = args
                .tags
                .iter()
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect();
            let entry = store
                .add_journal_entry(NewJournalEntry {
                    gateway_id: gateway.id.clone(),
                    content: args.content,
                    mood: args.mood,
                    tags,
                })
                .await?;
            println!("Journal entry [{}] added", short_id(&entry.id));
        }
        JournalCommand::List(args) => {
            let entries = store.list_journal(&gateway.id, args.limit).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("Journal is empty for gateway {}", gateway.name);
            }
            for entry in entries {
                println!("{}", entry_line(&entry));
            }
        }
        JournalCommand::Delete(args) => {
            let entry = find_entry(&*store, &gateway.id, &args.id).await?;
            store.delete_journal_entry(&entry.id).await?;
            println!("Deleted journal entry [{}]", short_id(&entry.id));
        }
    }
    Ok(())
}

fn entry_line(entry: &JournalEntry) -> String {
    let mut line = format!(
        "{} [{}]",
        entry.created_at.format("%Y-%m-%d %H:%M"),
        short_id(&entry.id)
    );
    if let Some(mood) = entry.mood.as_deref() {
        line.push_str(&format!(" ({mood})"));
    }
    line.push(' ');
    line.push_str(&entry.content);
    if !entry.tags.is_empty() {
        line.push_str(&format!(" #{}", entry.tags.join(" #")));
    }
    line
}

async fn find_entry(store: &dyn TaskStore, gateway_id: &str, id: &str) -> Result<JournalEntry> {
    let id = id.trim();
    if id.is_empty() {
        bail!("Journal entry id is required");
    }
    let entries = store.list_journal(gateway_id, LOOKUP_LIMIT).await?;
    if let Some(entry) = entries.iter().find(|entry| entry.id == id) {
        return Ok(entry.clone());
    }
    let mut matches = entries.into_iter().filter(|entry| entry.id.starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(entry), None) => Ok(entry),
        (Some(_), Some(_)) => bail!("Journal entry id prefix is ambiguous: {id}"),
        (None, _) => bail!("Journal entry not found: {id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn entry_line_shows_mood_and_tags() {
        let entry = JournalEntry {
            id: "0123456789".to_string(),
            gateway_id: "gw".to_string(),
            content: "Shipped 0.4".to_string(),
            mood: Some("relieved".to_string()),
            tags: vec!["release".to_string(), "ops".to_string()],
            created_at: Utc::now(),
        };
        let line = entry_line(&entry);
        assert!(line.contains("[01234567] (relieved) Shipped 0.4 #release #ops"));
    }
}
