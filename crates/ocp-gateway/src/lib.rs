pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod transport;

pub use client::{ConnectionSnapshot, ConnectionStatus, GatewayClient, GatewayEvent};
pub use config::ClientConfig;
pub use error::GatewayError;
pub use facade::{AgentAccepted, Gateway, RunOutcome, SessionListOptions};
pub use transport::{Connector, MemoryConnector, MemoryPeer, Transport, WsConnector};
