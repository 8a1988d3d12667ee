//! Socket abstraction under the protocol client.
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. The
//! websocket connector is used in production; [`MemoryConnector`] hands the
//! server side of each connection to the caller so tests can script a gateway.

use crate::error::GatewayError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError>;

    /// Next text message, or `None` once the peer has closed. Must be cancel-safe.
    async fn next_text(&mut self) -> Option<Result<String, GatewayError>>;

    async fn close(&mut self);
}

pub type OpenFuture = BoxFuture<'static, Result<Box<dyn Transport>, GatewayError>>;

pub trait Connector: Send + Sync {
    fn open(&self, url: &str) -> OpenFuture;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: &str) -> OpenFuture {
        let url = url.to_string();
        Box::pin(async move {
            let parsed = Url::parse(&url)
                .map_err(|err| GatewayError::Transport(format!("invalid url {url}: {err}")))?;
            let (stream, _) = connect_async(parsed.as_str())
                .await
                .map_err(|err| GatewayError::Transport(err.to_string()))?;
            Ok(Box::new(WsTransport { stream }) as Box<dyn Transport>)
        })
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, GatewayError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("ws_binary_frame_ignored"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(GatewayError::Transport(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Server half of an in-memory connection.
pub struct MemoryPeer {
    pub incoming: mpsc::UnboundedReceiver<String>,
    pub outgoing: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    pub fn send(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(text.into()).is_ok()
    }
}

struct MemoryTransport {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        let sender = self.outgoing.as_ref().ok_or(GatewayError::Closed)?;
        sender.send(text).map_err(|_| GatewayError::Closed)
    }

    async fn next_text(&mut self) -> Option<Result<String, GatewayError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.outgoing.take();
        self.incoming.close();
    }
}

/// Connector whose connections are handed to the receiver returned by [`MemoryConnector::new`].
/// Opening fails once that receiver is dropped.
#[derive(Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accepted, peers) = mpsc::unbounded_channel();
        (Self { accepted }, peers)
    }
}

impl Connector for MemoryConnector {
    fn open(&self, url: &str) -> OpenFuture {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            incoming: server_rx,
            outgoing: server_tx,
        };
        let result = self
            .accepted
            .send(peer)
            .map(|_| {
                Box::new(MemoryTransport {
                    outgoing: Some(client_tx),
                    incoming: client_rx,
                }) as Box<dyn Transport>
            })
            .map_err(|_| GatewayError::Transport(format!("connection refused: {url}")));
        Box::pin(async move { result })
    }
}
