use anyhow::{anyhow, bail, Context, Result};
use ocp_storage::SqliteTaskStore;
use std::env;
use std::path::PathBuf;

pub const DB_PATH_ENV: &str = "OCP_DB_PATH";
pub const GATEWAY_ENV: &str = "OCP_GATEWAY";
pub const GATEWAY_URL_ENV: &str = "OCP_GATEWAY_URL";
pub const GATEWAY_TOKEN_ENV: &str = "OCP_GATEWAY_TOKEN";

const DB_FILE_NAME: &str = "controlpane.db";
const ADHOC_GATEWAY_NAME: &str = "adhoc";

/// Endpoint a command talks to, either from the registry or from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGateway {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_db_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Some(path) = env_value(DB_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .ok_or_else(|| anyhow!("cannot determine a data directory; set {DB_PATH_ENV}"))?;
    Ok(base.join("ocp").join(DB_FILE_NAME))
}

pub fn open_store(path: &PathBuf) -> Result<SqliteTaskStore> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    SqliteTaskStore::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

/// Picks the gateway for a command: `--gateway`, then `OCP_GATEWAY`, then an
/// ad-hoc `OCP_GATEWAY_URL`, then the selected registry entry.
pub fn resolve_gateway(store: &SqliteTaskStore, flag: Option<&str>) -> Result<ResolvedGateway> {
    let requested = flag
        .map(str::to_string)
        .or_else(|| env_value(GATEWAY_ENV));
    if let Some(name) = requested {
        let config = store
            .gateway_by_name(&name)?
            .ok_or_else(|| anyhow!("Unknown gateway: {name}"))?;
        return Ok(ResolvedGateway {
            id: config.id,
            name: config.name,
            url: config.url,
            token: config.token.or_else(|| env_value(GATEWAY_TOKEN_ENV)),
        });
    }
    if let Some(url) = env_value(GATEWAY_URL_ENV) {
        return Ok(adhoc_gateway(&url, env_value(GATEWAY_TOKEN_ENV)));
    }
    match store.selected_gateway()? {
        Some(config) => Ok(ResolvedGateway {
            id: config.id,
            name: config.name,
            url: config.url,
            token: config.token.or_else(|| env_value(GATEWAY_TOKEN_ENV)),
        }),
        None => bail!("No gateway configured. Run `ocp gateway add <name> <url>` or set {GATEWAY_URL_ENV}"),
    }
}

/// Gateway described only by environment. Its data is scoped by URL.
pub fn adhoc_gateway(url: &str, token: Option<String>) -> ResolvedGateway {
    let url = url.trim().trim_end_matches('/').to_string();
    ResolvedGateway {
        id: format!("url:{url}"),
        name: ADHOC_GATEWAY_NAME.to_string(),
        url,
        token,
    }
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
