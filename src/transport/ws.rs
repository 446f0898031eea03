use std::collections::VecDeque;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{BoxFuture, ConnectionState, Transport};
use crate::config::ConnectionConfig;
use crate::error::CloseCause;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::server_events::ServerEvent;
use crate::{Error, Result, TRACE_LOG_MAX_BYTES, safe_truncate, validate_client_event};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OPENAI_BETA: HeaderName = HeaderName::from_static("openai-beta");
const REALTIME_PROTOCOL: &str = "realtime=v1";

/// Open an authenticated socket to the realtime endpoint.
///
/// # Errors
/// `Auth` for a missing or rejected credential, `Protocol` for any other
/// handshake rejection, `Network` for DNS/TCP/TLS failures and timeouts.
pub async fn connect(config: &ConnectionConfig) -> Result<Socket> {
    if config.api_key.trim().is_empty() {
        return Err(Error::Auth("API key is empty".to_string()));
    }

    let url = realtime_url(&config.url, &config.model)?;
    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", config.api_key))?);
    headers.insert(OPENAI_BETA, HeaderValue::from_static(REALTIME_PROTOCOL));

    let (socket, response) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| Error::Network(format!("connect timed out after {:?}", config.connect_timeout)))?
        .map_err(classify_handshake_error)?;

    tracing::info!(url = %url, status = %response.status(), "Connected to realtime endpoint");
    Ok(socket)
}

fn realtime_url(base: &str, model: &str) -> Result<Url> {
    let mut url = Url::parse(base)?;
    if !url.query_pairs().any(|(key, _)| key == "model") {
        url.query_pairs_mut().append_pair("model", model);
    }
    Ok(url)
}

fn classify_handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                Error::Auth(format!("server rejected credentials ({status})"))
            } else {
                Error::Protocol(format!("handshake rejected with HTTP {status}"))
            }
        }
        tungstenite::Error::Io(err) => Error::Network(err.to_string()),
        tungstenite::Error::Url(err) => Error::InvalidConfig(err.to_string()),
        tungstenite::Error::Protocol(err) => Error::Protocol(err.to_string()),
        other => Error::Network(other.to_string()),
    }
}

fn close_cause_of(err: &tungstenite::Error) -> CloseCause {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => CloseCause::Eof,
        other => CloseCause::Transport(other.to_string()),
    }
}

fn decode_event(text: &str) -> Result<ServerEvent> {
    serde_json::from_str(text)
        .map_err(|err| Error::Decode(format!("{err}: {}", safe_truncate(text, TRACE_LOG_MAX_BYTES))))
}

/// `Transport` over a live WebSocket.
///
/// Pongs for server pings are queued by tungstenite itself; this type only
/// tracks the pings it sends. Frames drained by [`Transport::keepalive`]
/// wait in `pending` until the next `next_event`.
#[must_use]
pub struct WsTransport {
    socket: Socket,
    state: ConnectionState,
    pending: VecDeque<Result<ServerEvent>>,
    ping_interval: Duration,
    ping_timeout: Duration,
    close_timeout: Duration,
    last_ping: Instant,
    awaiting_pong: Option<Instant>,
}

impl WsTransport {
    /// # Errors
    /// See [`connect`].
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        tracing::debug!(state = %ConnectionState::Connecting, model = %config.model, "Opening transport");
        let socket = connect(config).await?;
        Ok(Self {
            socket,
            state: ConnectionState::Active,
            pending: VecDeque::new(),
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            close_timeout: config.close_timeout,
            last_ping: Instant::now(),
            awaiting_pong: None,
        })
    }

    fn closed(&mut self, cause: CloseCause) -> Error {
        tracing::info!(%cause, "Connection closed");
        self.state = ConnectionState::Disconnected;
        Error::ConnectionClosed(cause)
    }

    /// Control frames are consumed here; events and closures are returned.
    fn on_frame(
        &mut self,
        frame: Option<std::result::Result<Message, tungstenite::Error>>,
    ) -> Option<Result<ServerEvent>> {
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Some(Err(self.closed(close_cause_of(&err)))),
            None => return Some(Err(self.closed(CloseCause::Eof))),
        };
        match frame {
            Message::Text(text) => {
                tracing::trace!("Received event: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                return Some(decode_event(&text));
            }
            Message::Close(frame) => {
                let cause = frame.map_or(CloseCause::Eof, |frame| CloseCause::Remote {
                    code: u16::from(frame.code),
                    reason: frame.reason.to_string(),
                });
                return Some(Err(self.closed(cause)));
            }
            Message::Pong(_) => {
                tracing::trace!("Received pong");
                self.awaiting_pong = None;
            }
            Message::Ping(_) => tracing::trace!("Received ping"),
            Message::Binary(payload) => {
                tracing::debug!(bytes = payload.len(), "Ignoring binary frame");
            }
            Message::Frame(_) => {}
        }
        None
    }

    /// Read every frame that is already available without waiting.
    fn drain_ready(&mut self) {
        while self.state == ConnectionState::Active {
            let Some(frame) = self.socket.next().now_or_never() else {
                break;
            };
            if let Some(outcome) = self.on_frame(frame) {
                self.pending.push_back(outcome);
            }
        }
        if !self.pending.is_empty() {
            tracing::debug!(queued = self.pending.len(), "Queued events read during keepalive");
        }
    }
}

impl Transport for WsTransport {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.state != ConnectionState::Active {
                return Err(Error::NotConnected);
            }
            validate_client_event(&event)?;
            let json = serde_json::to_string(&event)?;
            tracing::trace!(kind = event.kind(), "Sending event: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
            self.socket.send(Message::Text(json.into())).await?;
            Ok(())
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<ServerEvent>> {
        Box::pin(async move {
            if let Some(outcome) = self.pending.pop_front() {
                return outcome;
            }
            if self.state != ConnectionState::Active {
                return Err(Error::NotConnected);
            }
            loop {
                let frame = self.socket.next().await;
                if let Some(outcome) = self.on_frame(frame) {
                    return outcome;
                }
            }
        })
    }

    fn keepalive(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.state != ConnectionState::Active {
                return Err(Error::NotConnected);
            }
            if let Some(sent) = self.awaiting_pong {
                if sent.elapsed() < self.ping_timeout {
                    return Ok(());
                }
                // The pong may already be buffered if nothing read the socket for a while.
                self.drain_ready();
                if self.awaiting_pong.is_none() || self.state != ConnectionState::Active {
                    return Ok(());
                }
                tracing::warn!(timeout = ?self.ping_timeout, "Ping went unanswered");
                return Err(self.closed(CloseCause::KeepaliveTimeout));
            }
            if self.last_ping.elapsed() >= self.ping_interval {
                self.socket.send(Message::Ping(Vec::<u8>::new().into())).await?;
                let now = Instant::now();
                self.last_ping = now;
                self.awaiting_pong = Some(now);
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Closing) {
                return Ok(());
            }
            self.state = ConnectionState::Closing;
            match tokio::time::timeout(self.close_timeout, self.socket.close(None)).await {
                Ok(Ok(())) => tracing::debug!("Close handshake complete"),
                Ok(Err(err)) => tracing::debug!(error = %err, "Close handshake failed"),
                Err(_) => tracing::warn!(timeout = ?self.close_timeout, "Close handshake timed out"),
            }
            self.state = ConnectionState::Disconnected;
            Ok(())
        })
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
