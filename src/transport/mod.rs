//! Socket ownership: connect, send, receive, keepalive and close.

pub mod ws;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::Result;
use crate::config::ConnectionConfig;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::server_events::ServerEvent;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Active,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// One live connection handle.
///
/// `next_event` must be cancel-safe: the session task races it against
/// other work in `tokio::select!`.
pub trait Transport: Send {
    /// Serialize and transmit one event. Fails with `NotConnected` once closed.
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>>;

    /// Wait for the next decoded server event.
    ///
    /// Fails with `ConnectionClosed` when the peer goes away and with
    /// `Decode` when a text frame is not JSON.
    fn next_event(&mut self) -> BoxFuture<'_, Result<ServerEvent>>;

    /// Called on a fixed tick. Sends a ping when one is due and fails with
    /// `ConnectionClosed(KeepaliveTimeout)` if the previous ping went unanswered.
    fn keepalive(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Release the connection. Calling it again is a no-op.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    fn state(&self) -> ConnectionState;
}

/// Opens fresh transports; the orchestrator calls it once per (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>>;
}

/// Connects over a real WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        let transport = ws::WsTransport::connect(config).await?;
        Ok(Box::new(transport))
    }
}
