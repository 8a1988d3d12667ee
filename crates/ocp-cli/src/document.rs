use crate::task::{find_task, short_id};
use crate::Context as AppContext;
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use ocp_core::store::{Document, DocumentPatch, NewDocument};
use ocp_core::TaskStore;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum DocCommand {
    Add(DocAddArgs),
    #[command(alias = "ls")]
    List(DocListArgs),
    Show(DocTargetArgs),
    Edit(DocEditArgs),
    #[command(alias = "rm")]
    Delete(DocTargetArgs),
}

#[derive(Args, Debug)]
pub struct DocAddArgs {
    pub title: String,
    #[arg(long, conflicts_with = "file")]
    pub content: Option<String>,
    /// Read the content from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Document type; defaults to `deliverable`.
    #[arg(long = "type")]
    pub kind: Option<String>,
    /// Task id or unique prefix to attach the document to.
    #[arg(long)]
    pub task: Option<String>,
}

#[derive(Args, Debug)]
pub struct DocListArgs {
    /// Only documents attached to this task.
    #[arg(long)]
    pub task: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DocTargetArgs {
    /// Document id or unique prefix.
    pub id: String,
}

#[derive(Args, Debug)]
pub struct DocEditArgs {
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long, conflicts_with = "file")]
    pub content: Option<String>,
    #[arg(long)]
    pub file: Option<PathBuf>,
    #[arg(long = "type")]
    pub kind: Option<String>,
}

fn read_content(content: Option<String>, file: Option<PathBuf>) -> Result<Option<String>> {
    match (content, file) {
        (Some(content), _) => Ok(Some(content)),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .map(Some),
        (None, None) => Ok(None),
    }
}

pub async fn handle_doc_command(ctx: &AppContext, command: DocCommand) -> Result<()> {
    let gateway = ctx.gateway()?;
    let store = ctx.store.clone();
    match command {
        DocCommand::Add(args) => {
            let task_id = match args.task.as_deref() {
                Some(id) => Some(find_task(&*store, &gateway.id, id).await?.id),
                None => None,
            };
            let document = store
                .create_document(NewDocument {
                    gateway_id: gateway.id.clone(),
                    task_id,
                    title: args.title,
                    content: read_content(args.content, args.file)?.unwrap_or_default(),
                    kind: args.kind,
                })
                .await?;
            println!("Created document [{}] {}", short_id(&document.id), document.title);
        }
        DocCommand::List(args) => {
            let mut documents = store.list_documents(&gateway.id).await?;
            if let Some(id) = args.task.as_deref() {
                let task = find_task(&*store, &gateway.id, id).await?;
                documents.retain(|document| document.task_id.as_deref() == Some(task.id.as_str()));
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&documents)?);
                return Ok(());
            }
            if documents.is_empty() {
                println!("No documents for gateway {}", gateway.name);
            }
            for document in documents {
                let task = document
                    .task_id
                    .as_deref()
                    .map(|id| format!(" task:{}", short_id(id)))
                    .unwrap_or_default();
                println!(
                    "[{}] {} ({}){task}",
                    short_id(&document.id),
                    document.title,
                    document.kind
                );
            }
        }
        DocCommand::Show(args) => {
            let document = find_document(&*store, &gateway.id, &args.id).await?;
            println!("# {}", document.title);
            println!(
                "type: {}  updated: {}",
                document.kind,
                document.updated_at.format("%Y-%m-%d %H:%M")
            );
            println!();
            println!("{}", document.content);
        }
        DocCommand::Edit(args) => {
            let document = find_document(&*store, &gateway.id, &args.id).await?;
            let patch = DocumentPatch {
                title: args.title,
                content: read_content(args.content, args.file)?,
                kind: args.kind,
            };
            if patch == DocumentPatch::default() {
                bail!("Nothing to change; pass --title, --content, --file or --type");
            }
            let updated = store.update_document(&document.id, patch).await?;
            println!("Updated document [{}] {}", short_id(&updated.id), updated.title);
        }
        DocCommand::Delete(args) => {
            let document = find_document(&*store, &gateway.id, &args.id).await?;
            store.delete_document(&document.id).await?;
            println!("Deleted document [{}] {}", short_id(&document.id), document.title);
        }
    }
    Ok(())
}

async fn find_document(store: &dyn TaskStore, gateway_id: &str, id: &str) -> Result<Document> {
    let id = id.trim();
    if id.is_empty() {
        bail!("Document id is required");
    }
    let documents = store
        .list_documents(gateway_id)
        .await
        .context("Failed to list documents")?;
    if let Some(document) = documents.iter().find(|document| document.id == id) {
        return Ok(document.clone());
    }
    let mut matches = documents
        .into_iter()
        .filter(|document| document.id.starts_with(id));
    match (matches.next(), matches.next()) {
        (Some(document), None) => Ok(document),
        (Some(_), Some(_)) => bail!("Document id prefix is ambiguous: {id}"),
        (None, _) => bail!("Document not found: {id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocp_storage::SqliteTaskStore;
    use std::io::Write;

    #[tokio::test]
    async fn find_document_resolves_prefix_within_gateway() {
        let store = SqliteTaskStore::open_in_memory().expect("store");
        let document = store
            .create_document(NewDocument {
                gateway_id: "gw".to_string(),
                title: "Runbook".to_string(),
                ..NewDocument::default()
            })
            .await
            .expect("create");

        let found = find_document(&store, "gw", &document.id[..6]).await.expect("prefix");
        assert_eq!(found.id, document.id);
        assert!(find_document(&store, "other", &document.id).await.is_err());
        assert!(find_document(&store, "gw", " ").await.is_err());
    }

    #[test]
    fn content_prefers_inline_text_then_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "from disk").expect("write");

        assert_eq!(
            read_content(Some("inline".to_string()), None).expect("inline"),
            Some("inline".to_string())
        );
        assert_eq!(
            read_content(None, Some(file.path().to_path_buf())).expect("file"),
            Some("from disk".to_string())
        );
        assert_eq!(read_content(None, None).expect("none"), None);
        assert!(read_content(None, Some(PathBuf::from("/definitely/not/here"))).is_err());
    }
}
