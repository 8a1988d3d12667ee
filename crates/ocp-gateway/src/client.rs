//! Protocol client for one gateway connection.
//!
//! [`GatewayClient`] is a cheap cloneable handle. All connection state lives
//! in a single driver task that owns the socket, the pending-request table and
//! every timer; handles talk to it over an mpsc command channel and get
//! replies on oneshot channels. The driver exits once every handle is dropped.

use crate::config::{reconnect_delay, ClientConfig};
use crate::error::GatewayError;
use crate::transport::{Connector, OpenFuture, Transport};
use chrono::{DateTime, Utc};
use ocp_core::protocol::{
    decode_frame, encode_frame, ChallengePayload, EventFrame, Frame, RequestFrame, ResponseFrame,
    CHALLENGE_EVENT, CONNECT_METHOD, DEFAULT_MAX_FRAME_BYTES, PRESENCE_EVENT,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::pending;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    pub gateway_name: String,
    pub event: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub received_at: DateTime<Utc>,
}

/// Payloads cached from the last handshake and refreshes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub hello: Option<Value>,
    pub health: Option<Value>,
    pub presence: Option<Value>,
    pub reconnect_attempts: u32,
}

enum Command {
    Connect,
    Reconnect,
    Disconnect,
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, GatewayError>>,
    },
}

#[derive(Clone)]
pub struct GatewayClient {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<GatewayEvent>,
    snapshot: Arc<RwLock<ConnectionSnapshot>>,
}

impl GatewayClient {
    /// Spawns the connection driver. Must be called inside a tokio runtime.
    /// The client starts disconnected; call [`GatewayClient::connect`].
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let snapshot = Arc::new(RwLock::new(ConnectionSnapshot::default()));
        let name: Arc<str> = Arc::from(config.name.as_str());

        let driver = Driver {
            instance_id: Uuid::new_v4().to_string(),
            config,
            connector,
            commands: commands_rx,
            status_tx,
            events: events_tx.clone(),
            snapshot: snapshot.clone(),
            phase: Phase::Disconnected,
            socket: None,
            opening: None,
            pending: HashMap::new(),
            next_request: 0,
            reconnect_attempts: 0,
            challenge_deadline: None,
            reconnect_at: None,
            connect_sent: false,
        };
        tokio::spawn(driver.run());

        Self {
            name,
            commands: commands_tx,
            status: status_rx,
            events: events_tx,
            snapshot,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens the connection. A no-op while connecting or connected.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Zeroes the reconnect counter and connects again.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Closes the socket, stops reconnecting and fails all outstanding requests.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| GatewayError::Closed)?;
        rx.await.map_err(|_| GatewayError::Closed)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Waits until the handshake completes or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), GatewayError> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|status| *status == ConnectionStatus::Connected),
        )
        .await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => Err(GatewayError::Timeout {
                method: CONNECT_METHOD.to_string(),
            }),
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot
            .read()
            .map(|snapshot| snapshot.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Connected,
    Error,
}

impl Phase {
    fn status(self) -> ConnectionStatus {
        match self {
            Phase::Disconnected => ConnectionStatus::Disconnected,
            Phase::Connecting | Phase::AwaitingChallenge => ConnectionStatus::Connecting,
            Phase::Connected => ConnectionStatus::Connected,
            Phase::Error => ConnectionStatus::Error,
        }
    }
}

enum Reply {
    Caller(oneshot::Sender<Result<Value, GatewayError>>),
    Handshake,
    Health,
    Presence,
}

struct Pending {
    method: String,
    deadline: Instant,
    reply: Reply,
}

enum Step {
    Command(Command),
    Opened(Result<Box<dyn Transport>, GatewayError>),
    Inbound(Option<Result<String, GatewayError>>),
    Deadline,
    Shutdown,
}

struct Driver {
    instance_id: String,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<GatewayEvent>,
    snapshot: Arc<RwLock<ConnectionSnapshot>>,
    phase: Phase,
    socket: Option<Box<dyn Transport>>,
    opening: Option<OpenFuture>,
    pending: HashMap<String, Pending>,
    next_request: u64,
    reconnect_attempts: u32,
    challenge_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    connect_sent: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let wake = self.next_deadline();
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Shutdown,
                },
                opened = poll_opening(&mut self.opening) => Step::Opened(opened),
                inbound = next_inbound(&mut self.socket) => Step::Inbound(inbound),
                _ = sleep_until_deadline(wake) => Step::Deadline,
            };

            match step {
                Step::Command(command) => self.handle_command(command).await,
                Step::Opened(result) => {
                    self.opening = None;
                    self.handle_opened(result);
                }
                Step::Inbound(Some(Ok(text))) => self.handle_text(&text).await,
                Step::Inbound(Some(Err(err))) => {
                    warn!("gateway_socket_error: {} {err}", self.config.name);
                    self.handle_closed();
                }
                Step::Inbound(None) => self.handle_closed(),
                Step::Deadline => self.handle_deadlines().await,
                Step::Shutdown => {
                    self.shutdown().await;
                    break;
                }
            }
        }
        debug!("gateway_driver_exit: {}", self.config.name);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|pending| pending.deadline)
            .chain(self.challenge_deadline)
            .chain(self.reconnect_at)
            .min()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Reconnect => {
                self.reconnect_attempts = 0;
                self.update_snapshot(|snapshot| snapshot.reconnect_attempts = 0);
                self.connect();
            }
            Command::Disconnect => self.disconnect().await,
            Command::Request {
                method,
                params,
                reply,
            } => self.send_request(method, params, reply).await,
        }
    }

    fn connect(&mut self) {
        match self.phase {
            Phase::Connecting | Phase::AwaitingChallenge | Phase::Connected => {
                debug!("gateway_connect_skipped: {} {:?}", self.config.name, self.phase);
            }
            Phase::Disconnected | Phase::Error => self.start_attempt(),
        }
    }

    fn start_attempt(&mut self) {
        self.reconnect_at = None;
        self.challenge_deadline = None;
        self.connect_sent = false;
        self.set_phase(Phase::Connecting);
        info!("gateway_connecting: {} {}", self.config.name, self.config.url);
        let open = self.connector.open(&self.config.url);
        let limit = self.config.handshake_timeout;
        self.opening = Some(Box::pin(async move {
            match tokio::time::timeout(limit, open).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    method: CONNECT_METHOD.to_string(),
                }),
            }
        }));
    }

    fn handle_opened(&mut self, result: Result<Box<dyn Transport>, GatewayError>) {
        match result {
            Ok(socket) => {
                self.socket = Some(socket);
                self.set_phase(Phase::AwaitingChallenge);
                self.challenge_deadline = Some(Instant::now() + self.config.challenge_fallback);
            }
            Err(err) => {
                warn!("gateway_connect_error: {} {err}", self.config.name);
                self.set_phase(Phase::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn disconnect(&mut self) {
        self.reconnect_attempts = self.config.max_reconnect_attempts;
        self.reconnect_at = None;
        self.challenge_deadline = None;
        self.opening = None;
        self.close_socket().await;
        self.fail_pending(|| GatewayError::Closed);
        self.update_snapshot(|snapshot| {
            snapshot.hello = None;
            snapshot.health = None;
            snapshot.presence = None;
        });
        self.set_phase(Phase::Disconnected);
        info!("gateway_disconnected: {}", self.config.name);
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.challenge_deadline = None;
        self.opening = None;
        self.close_socket().await;
        self.fail_pending(|| GatewayError::Closed);
        self.set_phase(Phase::Disconnected);
    }

    async fn send_request(
        &mut self,
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, GatewayError>>,
    ) {
        match self.write_frame(&method, params).await {
            Ok(id) => {
                let deadline = Instant::now() + self.config.request_timeout;
                self.track(id, method, Reply::Caller(reply), deadline);
            }
            Err(err) => {
                let lost = err.is_transport();
                let _ = reply.send(Err(err));
                if lost {
                    self.handle_closed();
                }
            }
        }
    }

    /// Encodes and writes one request, returning its correlation id.
    async fn write_frame(&mut self, method: &str, params: Value) -> Result<String, GatewayError> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(GatewayError::NotConnected);
        };
        self.next_request += 1;
        let id = format!("cp-{}-{}", self.next_request, Utc::now().timestamp_millis());
        let frame = Frame::Req(RequestFrame {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        let encoded = encode_frame(&frame, DEFAULT_MAX_FRAME_BYTES)?;
        if let Err(err) = socket.send_text(encoded).await {
            warn!("gateway_send_error: {} {method} {err}", self.config.name);
            return Err(err);
        }
        debug!("gateway_request_sent: {} id={id} method={method}", self.config.name);
        Ok(id)
    }

    fn track(&mut self, id: String, method: String, reply: Reply, deadline: Instant) {
        self.pending.insert(
            id,
            Pending {
                method,
                deadline,
                reply,
            },
        );
    }

    async fn handle_text(&mut self, text: &str) {
        match decode_frame(text, DEFAULT_MAX_FRAME_BYTES) {
            Ok(Frame::Res(response)) => self.handle_response(response).await,
            Ok(Frame::Event(event)) => self.handle_event(event).await,
            Ok(Frame::Req(request)) => {
                warn!(
                    "gateway_unexpected_request: {} method={}",
                    self.config.name, request.method
                );
            }
            Err(err) => warn!("gateway_frame_dropped: {} {err}", self.config.name),
        }
    }

    async fn handle_response(&mut self, response: ResponseFrame) {
        let Some(pending) = self.pending.remove(&response.id) else {
            debug!(
                "gateway_response_dropped: {} id={} (unknown or expired)",
                self.config.name, response.id
            );
            return;
        };
        let result = if response.ok {
            Ok(response.payload.unwrap_or(Value::Null))
        } else {
            Err(GatewayError::Remote {
                message: response.error_text(),
                code: response.error.and_then(|error| error.code),
            })
        };
        if let Err(err) = &result {
            debug!(
                "gateway_request_failed: {} method={} {err}",
                self.config.name, pending.method
            );
        }
        self.resolve(pending.reply, result).await;
    }

    async fn resolve(&mut self, reply: Reply, result: Result<Value, GatewayError>) {
        match reply {
            Reply::Caller(sender) => {
                let _ = sender.send(result);
            }
            Reply::Handshake => match result {
                Ok(hello) => self.handle_hello(hello).await,
                Err(err) => self.handshake_failed(err).await,
            },
            Reply::Health => {
                if let Ok(health) = result {
                    self.update_snapshot(|snapshot| snapshot.health = Some(health));
                }
            }
            Reply::Presence => {
                if let Ok(presence) = result {
                    self.update_snapshot(|snapshot| snapshot.presence = Some(presence));
                }
            }
        }
    }

    async fn handle_event(&mut self, event: EventFrame) {
        if event.event == CHALLENGE_EVENT {
            if self.phase == Phase::AwaitingChallenge && !self.connect_sent {
                let challenge = ChallengePayload::from_value(&event.payload);
                self.challenge_deadline = None;
                self.send_connect(challenge.nonce).await;
            } else {
                debug!("gateway_challenge_ignored: {}", self.config.name);
            }
            return;
        }
        if event.event == PRESENCE_EVENT {
            let presence = event.payload.clone();
            self.update_snapshot(|snapshot| snapshot.presence = Some(presence));
        }
        let _ = self.events.send(GatewayEvent {
            gateway_name: self.config.name.clone(),
            event: event.event,
            payload: event.payload,
            seq: event.seq,
            received_at: Utc::now(),
        });
    }

    async fn send_connect(&mut self, nonce: Option<String>) {
        self.connect_sent = true;
        let params = match serde_json::to_value(self.config.connect_params(nonce, &self.instance_id))
        {
            Ok(params) => params,
            Err(err) => {
                self.handshake_failed(GatewayError::Handshake(err.to_string()))
                    .await;
                return;
            }
        };
        match self.write_frame(CONNECT_METHOD, params).await {
            Ok(id) => {
                let deadline = Instant::now() + self.config.handshake_timeout;
                self.track(id, CONNECT_METHOD.to_string(), Reply::Handshake, deadline);
            }
            Err(err) if err.is_transport() => self.handle_closed(),
            Err(err) => self.handshake_failed(err).await,
        }
    }

    async fn handle_hello(&mut self, hello: Value) {
        self.reconnect_attempts = 0;
        self.update_snapshot(|snapshot| {
            snapshot.hello = Some(hello);
            snapshot.reconnect_attempts = 0;
        });
        self.set_phase(Phase::Connected);
        info!("gateway_connected: {}", self.config.name);
        self.refresh_snapshot().await;
    }

    async fn refresh_snapshot(&mut self) {
        let deadline = Instant::now() + self.config.request_timeout;
        for (method, reply) in [("health", Reply::Health), ("system-presence", Reply::Presence)] {
            match self.write_frame(method, Value::Object(Default::default())).await {
                Ok(id) => self.track(id, method.to_string(), reply, deadline),
                Err(err) => {
                    debug!("gateway_refresh_failed: {} {method} {err}", self.config.name);
                    if err.is_transport() {
                        self.handle_closed();
                    }
                    return;
                }
            }
        }
    }

    async fn handshake_failed(&mut self, err: GatewayError) {
        warn!("gateway_handshake_failed: {} {err}", self.config.name);
        self.challenge_deadline = None;
        self.close_socket().await;
        self.fail_pending(|| GatewayError::Closed);
        self.set_phase(Phase::Error);
        self.schedule_reconnect();
    }

    fn handle_closed(&mut self) {
        if self.socket.is_none() {
            return;
        }
        self.socket = None;
        self.challenge_deadline = None;
        self.fail_pending(|| GatewayError::Closed);
        let next = if self.phase == Phase::Connected {
            Phase::Disconnected
        } else {
            Phase::Error
        };
        self.set_phase(next);
        info!("gateway_closed: {}", self.config.name);
        self.schedule_reconnect();
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();

        if self.challenge_deadline.is_some_and(|deadline| deadline <= now) {
            self.challenge_deadline = None;
            if self.phase == Phase::AwaitingChallenge && !self.connect_sent {
                debug!("gateway_challenge_fallback: {}", self.config.name);
                self.send_connect(None).await;
            }
        }

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            debug!(
                "gateway_request_timeout: {} id={id} method={}",
                self.config.name, pending.method
            );
            let err = GatewayError::Timeout {
                method: pending.method,
            };
            self.resolve(pending.reply, Err(err)).await;
        }

        if self.reconnect_at.is_some_and(|deadline| deadline <= now) {
            self.reconnect_at = None;
            if matches!(self.phase, Phase::Disconnected | Phase::Error) {
                self.start_attempt();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            info!(
                "gateway_reconnect_stopped: {} attempts={}",
                self.config.name, self.reconnect_attempts
            );
            return;
        }
        let delay = reconnect_delay(
            self.reconnect_attempts,
            self.config.backoff_base,
            self.config.backoff_cap,
        );
        self.reconnect_attempts += 1;
        let attempts = self.reconnect_attempts;
        self.update_snapshot(|snapshot| snapshot.reconnect_attempts = attempts);
        info!(
            "gateway_reconnect_scheduled: {} attempt={attempts} delay_ms={}",
            self.config.name,
            delay.as_millis()
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    async fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> GatewayError) {
        for (_, pending) in self.pending.drain() {
            if let Reply::Caller(sender) = pending.reply {
                let _ = sender.send(Err(err()));
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        let status = phase.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn update_snapshot(&self, update: impl FnOnce(&mut ConnectionSnapshot)) {
        if let Ok(mut snapshot) = self.snapshot.write() {
            update(&mut snapshot);
        }
    }
}

async fn poll_opening(opening: &mut Option<OpenFuture>) -> Result<Box<dyn Transport>, GatewayError> {
    match opening.as_mut() {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_inbound(socket: &mut Option<Box<dyn Transport>>) -> Option<Result<String, GatewayError>> {
    match socket.as_mut() {
        Some(socket) => socket.next_text().await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
