use ocp_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MissionError {
    #[error("task {0} has no assignee")]
    NoAssignee(String),
    #[error("gateway not connected")]
    NotConnected,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
