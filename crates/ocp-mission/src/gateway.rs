use async_trait::async_trait;
use ocp_core::{ChatHistory, SessionDescriptor};
use ocp_gateway::{AgentAccepted, Gateway, GatewayError, RunOutcome, SessionListOptions};
use std::time::Duration;

/// Gateway operations the orchestration layer depends on.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn list_sessions(&self) -> Option<Vec<SessionDescriptor>>;

    async fn chat_history(&self, session_key: &str, limit: usize) -> Option<ChatHistory>;

    async fn send_to_session(
        &self,
        message: &str,
        session_key: &str,
    ) -> Result<AgentAccepted, GatewayError>;

    async fn agent_wait(&self, run_id: &str, timeout: Duration) -> Option<RunOutcome>;
}

#[async_trait]
impl AgentGateway for Gateway {
    fn is_connected(&self) -> bool {
        Gateway::is_connected(self)
    }

    async fn list_sessions(&self) -> Option<Vec<SessionDescriptor>> {
        Gateway::list_sessions(self, SessionListOptions::default()).await
    }

    async fn chat_history(&self, session_key: &str, limit: usize) -> Option<ChatHistory> {
        Gateway::chat_history(self, session_key, limit).await
    }

    async fn send_to_session(
        &self,
        message: &str,
        session_key: &str,
    ) -> Result<AgentAccepted, GatewayError> {
        self.agent(message, session_key, serde_json::json!({})).await
    }

    async fn agent_wait(&self, run_id: &str, timeout: Duration) -> Option<RunOutcome> {
        Gateway::agent_wait(self, run_id, timeout).await
    }
}
