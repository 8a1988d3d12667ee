use ocp_core::protocol::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway not connected")]
    NotConnected,
    #[error("gateway connection closed")]
    Closed,
    #[error("request timed out: {method}")]
    Timeout { method: String },
    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
    },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl GatewayError {
    /// True for failures of the connection itself rather than of one request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::NotConnected | GatewayError::Closed | GatewayError::Transport(_)
        )
    }
}
