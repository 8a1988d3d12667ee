//! Typed gateway operations on top of [`GatewayClient::request`].
//!
//! Informational reads swallow their own failure (logged) and return `None`;
//! anything that mutates gateway state returns the error to the caller.

use crate::client::GatewayClient;
use crate::error::GatewayError;
use chrono::Utc;
use ocp_core::session::canonical_session_key;
use ocp_core::{ChatHistory, SessionDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_SESSION_LIST_LIMIT: u32 = 50;
pub const DEFAULT_AGENT_WAIT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_CRON_RUNS_LIMIT: u32 = 10;
pub const DEFAULT_CRON_RUN_MODE: &str = "force";
pub const DEFAULT_WAKE_MODE: &str = "now";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionListOptions {
    pub include_derived_titles: bool,
    pub include_last_message: bool,
    pub limit: u32,
}

impl Default for SessionListOptions {
    fn default() -> Self {
        Self {
            include_derived_titles: true,
            include_last_message: true,
            limit: DEFAULT_SESSION_LIST_LIMIT,
        }
    }
}

/// Gateway acknowledgement of an `agent` dispatch. Carries no session key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAccepted {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub accepted_at: Option<i64>,
}

/// Result of `agent.wait`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Gateway {
    client: GatewayClient,
}

impl Gateway {
    pub fn new(client: GatewayClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn read(&self, method: &str, params: Value) -> Option<Value> {
        match self.client.request(method, params).await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("gateway_read_failed: {} {method} {err}", self.client.name());
                None
            }
        }
    }

    async fn write(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.client.request(method, params).await
    }

    pub async fn health(&self) -> Option<Value> {
        self.read("health", json!({})).await
    }

    pub async fn status(&self) -> Option<Value> {
        self.read("status", json!({})).await
    }

    pub async fn system_presence(&self) -> Option<Value> {
        self.read("system-presence", json!({})).await
    }

    pub async fn node_list(&self) -> Option<Value> {
        self.read("node.list", json!({})).await
    }

    pub async fn agents_list(&self) -> Option<Value> {
        self.read("agents.list", json!({})).await
    }

    pub async fn agents_create(&self, params: Value) -> Result<Value, GatewayError> {
        self.write("agents.create", params).await
    }

    pub async fn agents_update(&self, params: Value) -> Result<Value, GatewayError> {
        self.write("agents.update", params).await
    }

    pub async fn agents_delete(&self, agent_id: &str) -> Result<Value, GatewayError> {
        self.write("agents.delete", json!({ "agentId": agent_id })).await
    }

    pub async fn agent_files_list(&self, agent_id: &str) -> Option<Value> {
        self.read("agents.files.list", json!({ "agentId": agent_id }))
            .await
    }

    pub async fn agent_file_get(&self, agent_id: &str, name: &str) -> Option<Value> {
        self.read("agents.files.get", json!({ "agentId": agent_id, "name": name }))
            .await
    }

    pub async fn agent_file_set(
        &self,
        agent_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Value, GatewayError> {
        self.write(
            "agents.files.set",
            json!({ "agentId": agent_id, "name": name, "content": content }),
        )
        .await
    }

    pub async fn agent_identity(&self, agent_id: Option<&str>) -> Option<Value> {
        let params = match agent_id {
            Some(agent_id) => json!({ "agentId": agent_id }),
            None => json!({}),
        };
        self.read("agent.identity", params).await
    }

    pub async fn sessions_list_raw(&self, options: SessionListOptions) -> Option<Value> {
        self.read(
            "sessions.list",
            json!({
                "includeDerivedTitles": options.include_derived_titles,
                "includeLastMessage": options.include_last_message,
                "limit": options.limit,
            }),
        )
        .await
    }

    pub async fn list_sessions(&self, options: SessionListOptions) -> Option<Vec<SessionDescriptor>> {
        self.sessions_list_raw(options)
            .await
            .map(|value| SessionDescriptor::list_from_value(&value))
    }

    pub async fn sessions_preview(&self, keys: &[String]) -> Option<Value> {
        self.read("sessions.preview", json!({ "keys": keys })).await
    }

    pub async fn sessions_usage(&self, params: Value) -> Option<Value> {
        self.read("sessions.usage", params).await
    }

    pub async fn sessions_patch(&self, key: &str, patch: Value) -> Result<Value, GatewayError> {
        self.write("sessions.patch", merge(json!({ "key": key }), patch))
            .await
    }

    pub async fn sessions_reset(&self, key: &str) -> Result<Value, GatewayError> {
        self.write("sessions.reset", json!({ "key": key })).await
    }

    pub async fn sessions_delete(
        &self,
        key: &str,
        delete_transcript: bool,
    ) -> Result<Value, GatewayError> {
        self.write(
            "sessions.delete",
            json!({ "key": key, "deleteTranscript": delete_transcript }),
        )
        .await
    }

    pub async fn sessions_compact(
        &self,
        key: &str,
        max_lines: Option<u32>,
    ) -> Result<Value, GatewayError> {
        let mut params = json!({ "key": key });
        if let Some(max_lines) = max_lines {
            params["maxLines"] = json!(max_lines);
        }
        self.write("sessions.compact", params).await
    }

    pub async fn chat_history(&self, session_key: &str, limit: usize) -> Option<ChatHistory> {
        self.read(
            "chat.history",
            json!({ "sessionKey": session_key, "limit": limit }),
        )
        .await
        .map(ChatHistory::from_value)
    }

    pub async fn chat_send(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: Option<String>,
    ) -> Result<Value, GatewayError> {
        let idempotency_key = idempotency_key.unwrap_or_else(new_idempotency_key);
        self.write(
            "chat.send",
            json!({
                "sessionKey": session_key,
                "message": message,
                "idempotencyKey": idempotency_key,
            }),
        )
        .await
    }

    pub async fn chat_inject(&self, session_key: &str, message: &str) -> Result<Value, GatewayError> {
        self.write(
            "chat.inject",
            json!({ "sessionKey": session_key, "message": message }),
        )
        .await
    }

    pub async fn chat_abort(
        &self,
        session_key: &str,
        run_id: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut params = json!({ "sessionKey": session_key });
        if let Some(run_id) = run_id {
            params["runId"] = json!(run_id);
        }
        self.write("chat.abort", params).await
    }

    /// Raw `agent` dispatch. Extra fields are merged over the defaults.
    pub async fn agent(
        &self,
        message: &str,
        session_key: &str,
        extra: Value,
    ) -> Result<AgentAccepted, GatewayError> {
        let params = merge(
            json!({
                "message": message,
                "idempotencyKey": new_idempotency_key(),
                "sessionKey": session_key,
            }),
            extra,
        );
        let payload = self.write("agent", params).await?;
        Ok(serde_json::from_value(payload).unwrap_or_default())
    }

    /// Dispatches to an agent's main session. Only the session key travels;
    /// the gateway resolves the agent from it.
    pub async fn send_to_agent(
        &self,
        message: &str,
        agent_id: &str,
    ) -> Result<AgentAccepted, GatewayError> {
        self.agent(message, &canonical_session_key(agent_id), json!({}))
            .await
    }

    pub async fn agent_wait(&self, run_id: &str, timeout: Duration) -> Option<RunOutcome> {
        self.read(
            "agent.wait",
            json!({ "runId": run_id, "timeoutMs": timeout.as_millis() as u64 }),
        )
        .await
        .map(|value| serde_json::from_value(value).unwrap_or_default())
    }

    pub async fn wake(&self, text: &str, mode: Option<&str>) -> Result<Value, GatewayError> {
        self.write(
            "wake",
            json!({ "text": text, "mode": mode.unwrap_or(DEFAULT_WAKE_MODE) }),
        )
        .await
    }

    pub async fn cron_list(&self) -> Option<Value> {
        self.read("cron.list", json!({})).await
    }

    pub async fn cron_status(&self) -> Option<Value> {
        self.read("cron.status", json!({})).await
    }

    pub async fn cron_add(&self, job: Value) -> Result<Value, GatewayError> {
        self.write("cron.add", job).await
    }

    pub async fn cron_update(&self, id: &str, patch: Value) -> Result<Value, GatewayError> {
        self.write("cron.update", merge(json!({ "id": id }), patch))
            .await
    }

    pub async fn cron_remove(&self, id: &str) -> Result<Value, GatewayError> {
        self.write("cron.remove", json!({ "id": id })).await
    }

    pub async fn cron_run(&self, id: &str, mode: Option<&str>) -> Result<Value, GatewayError> {
        self.write(
            "cron.run",
            json!({ "id": id, "mode": mode.unwrap_or(DEFAULT_CRON_RUN_MODE) }),
        )
        .await
    }

    pub async fn cron_runs(&self, id: &str, limit: Option<u32>) -> Option<Value> {
        self.read(
            "cron.runs",
            json!({ "id": id, "limit": limit.unwrap_or(DEFAULT_CRON_RUNS_LIMIT) }),
        )
        .await
    }

    pub async fn models_list(&self) -> Option<Value> {
        self.read("models.list", json!({})).await
    }

    pub async fn config_get(&self) -> Option<Value> {
        self.read("config.get", json!({})).await
    }
}

fn new_idempotency_key() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("cp-{}-{}", Utc::now().timestamp_millis(), &random[..6])
}

/// Shallow object merge; keys in `extra` win. Non-object `extra` is ignored.
fn merge(base: Value, extra: Value) -> Value {
    let mut merged: Map<String, Value> = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Value::Object(extra) = extra {
        merged.extend(extra);
    }
    Value::Object(merged)
}
