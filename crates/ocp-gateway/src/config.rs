use ocp_core::protocol::{
    ClientDescriptor, ConnectAuth, ConnectDevice, ConnectParams, PROTOCOL_VERSION,
};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHALLENGE_FALLBACK: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const DEFAULT_EVENT_BUFFER: usize = 256;

pub const CLIENT_ID: &str = "gateway-client";
pub const CLIENT_DISPLAY_NAME: &str = "OpenClaw ControlPane";
pub const CLIENT_MODE: &str = "ui";
pub const OPERATOR_ROLE: &str = "operator";
pub const OPERATOR_SCOPES: [&str; 2] = ["operator.read", "operator.write"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub locale: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            display_name: CLIENT_DISPLAY_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: CLIENT_MODE.to_string(),
            locale: "en-US".to_string(),
        }
    }
}

impl ClientIdentity {
    pub fn user_agent(&self) -> String {
        format!("openclaw-controlpane/{}", self.version)
    }
}

/// Connection settings for one gateway endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub identity: ClientIdentity,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub challenge_fallback: Duration,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub event_buffer: usize,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: normalize_url(&url.into()),
            token: None,
            identity: ClientIdentity::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            challenge_fallback: DEFAULT_CHALLENGE_FALLBACK,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub(crate) fn connect_params(&self, nonce: Option<String>, instance_id: &str) -> ConnectParams {
        ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientDescriptor {
                id: self.identity.client_id.clone(),
                display_name: self.identity.display_name.clone(),
                version: self.identity.version.clone(),
                platform: self.identity.platform.clone(),
                mode: self.identity.mode.clone(),
                instance_id: instance_id.to_string(),
            },
            role: OPERATOR_ROLE.to_string(),
            scopes: OPERATOR_SCOPES.iter().map(|scope| scope.to_string()).collect(),
            caps: Vec::new(),
            commands: Vec::new(),
            permissions: serde_json::Map::new(),
            auth: self.token.clone().map(|token| ConnectAuth { token }),
            device: nonce.map(|nonce| ConnectDevice { nonce }),
            locale: self.identity.locale.clone(),
            user_agent: self.identity.user_agent(),
        }
    }
}

/// Backoff before reconnect attempt `attempts`: `min(base * 2^attempts, cap)`.
pub fn reconnect_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

/// Prefixes a bare `host:port` with `ws://` and drops trailing slashes.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        format!("ws://{trimmed}")
    }
}
