use crate::config::ResolvedGateway;
use crate::Context as AppContext;
use anyhow::{bail, Context, Result};
use clap::Args;
use ocp_gateway::{ClientConfig, Gateway, GatewayClient, SessionListOptions, WsConnector};
use ocp_mission::{MissionConfig, MissionControl};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[arg(long, default_value_t = 50)]
    pub limit: u32,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Remote method, e.g. `agents.list`.
    pub method: String,
    /// JSON params; defaults to `{}`.
    pub params: Option<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Log the outcome of each dispatched run via `agent.wait`.
    #[arg(long)]
    pub wait_for_run: bool,
}

fn client_for(gateway: &ResolvedGateway) -> GatewayClient {
    let config = ClientConfig::new(gateway.name.clone(), gateway.url.clone())
        .with_token(gateway.token.clone());
    GatewayClient::new(config, Arc::new(WsConnector))
}

/// Opens a connection and waits for the handshake to finish.
pub async fn connect(gateway: &ResolvedGateway) -> Result<Gateway> {
    let client = client_for(gateway);
    client.connect();
    if let Err(err) = client.wait_connected(CONNECT_TIMEOUT).await {
        client.disconnect();
        return Err(err).with_context(|| format!("Failed to connect to {} ({})", gateway.name, gateway.url));
    }
    Ok(Gateway::new(client))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn health(ctx: &AppContext) -> Result<()> {
    let gateway = connect(&ctx.gateway()?).await?;
    let health = gateway.health().await;
    gateway.client().disconnect();
    match health {
        Some(value) => print_json(&value),
        None => bail!("Gateway did not answer health"),
    }
}

pub async fn sessions(ctx: &AppContext, args: SessionsArgs) -> Result<()> {
    let gateway = connect(&ctx.gateway()?).await?;
    let options = SessionListOptions {
        limit: args.limit,
        ..SessionListOptions::default()
    };
    let sessions = gateway.list_sessions(options).await;
    gateway.client().disconnect();
    let Some(sessions) = sessions else {
        bail!("Gateway did not return sessions");
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    for session in sessions {
        let updated = session
            .updated_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  {}",
            session.key,
            updated,
            session.derived_title.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn call(ctx: &AppContext, args: CallArgs) -> Result<()> {
    let params: Value = match args.params.as_deref() {
        Some(raw) => serde_json::from_str(raw).context("params must be valid JSON")?,
        None => Value::Object(Default::default()),
    };
    let gateway = connect(&ctx.gateway()?).await?;
    let result = gateway.client().request(&args.method, params).await;
    gateway.client().disconnect();
    print_json(&result?)
}

/// Runs discovery and watchers until Ctrl-C.
pub async fn watch(ctx: &AppContext, args: WatchArgs) -> Result<()> {
    let resolved = ctx.gateway()?;
    let client = client_for(&resolved);
    let events = client.subscribe();
    let status = client.watch_status();
    client.connect();

    let mut config = MissionConfig::new(resolved.id.clone());
    config.wait_for_run = args.wait_for_run;
    let mission = MissionControl::new(
        config,
        Arc::new(Gateway::new(client.clone())),
        ctx.store.clone(),
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("signal_listen_failed: {err}");
        }
        signal_token.cancel();
    });

    info!("watch_started: gateway={} url={}", resolved.name, resolved.url);
    mission.run(events, status, shutdown).await;
    client.disconnect();
    Ok(())
}
