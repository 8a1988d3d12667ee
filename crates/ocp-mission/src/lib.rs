//! Task orchestration for one gateway: session discovery, dispatch, and
//! completion watching on top of the gateway facade and a task store.

use ocp_core::TaskStore;
use std::sync::Arc;

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod mission;
pub mod watcher;

pub use config::MissionConfig;
pub use discovery::{DiscoveryTable, PassReport};
pub use dispatch::{DispatchOutcome, Dispatched};
pub use error::MissionError;
pub use gateway::AgentGateway;
pub use mission::MissionControl;
pub use watcher::{Completion, CompletionReason, WatcherTable};

/// Handles shared by discovery, dispatch, and every watcher loop.
#[derive(Clone)]
pub struct MissionContext {
    pub config: Arc<MissionConfig>,
    pub gateway: Arc<dyn AgentGateway>,
    pub store: Arc<dyn TaskStore>,
}

impl MissionContext {
    pub fn new(
        config: MissionConfig,
        gateway: Arc<dyn AgentGateway>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            store,
        }
    }
}
