use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::ShutdownHandle;
use super::dispatcher::{Dispatcher, TranscriptObserver};
use crate::audio::{CaptureBuffer, CaptureDevice, CaptureState, NoCapture, PlaybackSink, SilentSink};
use crate::config::Config;
use crate::error::CloseCause;
use crate::latency::LatencyLog;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{Item, SessionUpdate};
use crate::tools::ToolRegistry;
use crate::transport::{Connector, Transport, WsConnector};
use crate::{Error, Result};

const NORMAL_CLOSURE: u16 = 1000;
const MIN_TICK: Duration = Duration::from_millis(1);

/// Owns one voice session from startup to shutdown.
///
/// Wires the capture device, the transport and the [`Dispatcher`] together,
/// reconnects after keepalive failures and tears everything down in order.
pub struct Orchestrator {
    config: Config,
    connector: Arc<dyn Connector>,
    tools: ToolRegistry,
    device: Box<dyn CaptureDevice>,
    sink: Arc<dyn PlaybackSink>,
    transcript: Option<TranscriptObserver>,
    shutdown: ShutdownHandle,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            tools: ToolRegistry::with_defaults(),
            device: Box::new(NoCapture),
            sink: Arc::new(SilentSink),
            transcript: None,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Session over a real WebSocket.
    #[must_use]
    pub fn websocket(config: Config) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn capture(mut self, device: impl CaptureDevice + 'static) -> Self {
        self.device = Box::new(device);
        self
    }

    #[must_use]
    pub fn playback(mut self, sink: impl PlaybackSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Observe assistant text and audio transcript deltas as they arrive.
    #[must_use]
    pub fn on_transcript(mut self, observer: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.transcript = Some(Arc::new(observer));
        self
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested, the server closes normally, or a
    /// non-retryable error occurs.
    ///
    /// # Errors
    /// Connection, authentication and device failures that ended the session.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            connector,
            tools,
            mut device,
            sink,
            transcript,
            shutdown,
        } = self;

        let tools = Arc::new(tools);
        let update = config.session.to_update(tools.definitions());
        let latency = config
            .latency_log
            .clone()
            .map_or_else(LatencyLog::disabled, LatencyLog::to_file);

        let buffer = CaptureBuffer::new();
        device.start(buffer.clone())?;

        let mut dispatcher = Dispatcher::new(buffer.clone(), tools, sink).with_latency_log(latency);
        if let Some(observer) = transcript {
            dispatcher = dispatcher.with_transcript(observer);
        }

        let session = Session {
            config: &config,
            connector: connector.as_ref(),
            update: &update,
            buffer: &buffer,
            shutdown: &shutdown,
        };
        let result = session.run(&mut dispatcher).await;

        shutdown.trigger();
        buffer.stop_capture();
        buffer.clear();
        device.stop();
        match &result {
            Ok(()) => tracing::info!("Session ended"),
            Err(err) => tracing::error!(error = %err, "Session ended with error"),
        }
        result
    }
}

/// Borrowed view of everything one connection needs.
struct Session<'a> {
    config: &'a Config,
    connector: &'a dyn Connector,
    update: &'a SessionUpdate,
    buffer: &'a CaptureBuffer,
    shutdown: &'a ShutdownHandle,
}

impl Session<'_> {
    async fn run(&self, dispatcher: &mut Dispatcher) -> Result<()> {
        let mut prompts = self.config.initial_prompts.as_slice();
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let connected = tokio::select! {
                () = self.shutdown.wait() => return Ok(()),
                result = self.connector.connect(&self.config.connection) => result,
            };
            let mut transport = connected?;
            tracing::info!(attempt, model = %self.config.connection.model, "Connected to realtime API");

            let outcome = self.drive(transport.as_mut(), dispatcher, prompts).await;
            prompts = &[];
            self.buffer.stop_capture();
            if let Err(err) = transport.close().await {
                tracing::debug!(error = %err, "Close after session failed");
            }

            match outcome {
                Ok(()) => return Ok(()),
                Err(Error::ConnectionClosed(CloseCause::Remote { code, .. })) if code == NORMAL_CLOSURE => {
                    tracing::info!("Server closed the session");
                    return Ok(());
                }
                Err(err) if err.is_retryable() && !self.shutdown.is_triggered() => {
                    tracing::warn!(error = %err, backoff = ?self.config.reconnect_backoff, "Reconnecting");
                    dispatcher.reset();
                    self.buffer.clear();
                    tokio::select! {
                        () = self.shutdown.wait() => return Ok(()),
                        () = tokio::time::sleep(self.config.reconnect_backoff) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn drive(&self, transport: &mut dyn Transport, dispatcher: &mut Dispatcher, prompts: &[String]) -> Result<()> {
        transport.send(ClientEvent::session_update(self.update.clone())).await?;
        if prompts.is_empty() {
            self.buffer.start_capture();
        } else {
            for prompt in prompts {
                tracing::info!(prompt = %prompt, "Sending prompt");
                transport.send(ClientEvent::create_item(Item::user_text(prompt.clone()))).await?;
                transport.send(ClientEvent::create_response()).await?;
            }
        }

        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_capture(
            self.buffer.clone(),
            audio_tx,
            self.config.poll_interval.max(MIN_TICK),
            self.shutdown.clone(),
        ));

        let result = self.pump(transport, dispatcher, &mut audio_rx).await;

        drop(audio_rx);
        if let Err(err) = forwarder.await {
            tracing::warn!(error = %err, "Capture forwarder panicked");
        }
        result
    }

    async fn pump(
        &self,
        transport: &mut dyn Transport,
        dispatcher: &mut Dispatcher,
        audio_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<()> {
        let connection = &self.config.connection;
        let tick = connection.ping_interval.min(connection.ping_timeout).max(MIN_TICK);
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.wait() => return Ok(()),
                Some(pcm) = audio_rx.recv() => {
                    let audio = general_purpose::STANDARD.encode(&pcm);
                    tracing::trace!(bytes = pcm.len(), "Forwarding captured audio");
                    transport.send(ClientEvent::append_audio(audio)).await?;
                }
                event = transport.next_event() => dispatcher.handle(event?, transport).await?,
                _ = keepalive.tick() => transport.keepalive().await?,
            }
        }
    }
}

/// Moves captured PCM from the shared buffer to the session task at a
/// fixed cadence. Nothing is forwarded while a response is playing.
async fn forward_capture(
    buffer: CaptureBuffer,
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    poll_interval: Duration,
    shutdown: ShutdownHandle,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.wait() => break,
            () = audio_tx.closed() => break,
            _ = ticker.tick() => {
                if buffer.state() == CaptureState::Receiving {
                    continue;
                }
                if let Some(pcm) = buffer.drain() {
                    if audio_tx.send(pcm).is_err() {
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("Capture forwarder stopped");
}
