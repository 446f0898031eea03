use std::sync::Arc;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::Result;
use crate::audio::{CaptureBuffer, CaptureState, PlaybackSink};
use crate::error::ServerError;
use crate::latency::LatencyLog;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::Item;
use crate::protocol::server_events::ServerEvent;
use crate::tools::{ToolCall, ToolRegistry};
use crate::transport::Transport;

pub type TranscriptObserver = Arc<dyn Fn(&str) + Send + Sync>;

const RESPONSE_LATENCY: &str = "realtime_api_response";

/// Server audio chunks are decoded leniently: non-zero trailing bits and
/// missing padding are accepted.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// One assistant turn, accumulated from streamed deltas.
#[derive(Debug)]
pub struct ResponseState {
    text: String,
    audio: Vec<u8>,
    started: Instant,
}

impl ResponseState {
    fn new() -> Self {
        Self {
            text: String::new(),
            audio: Vec::new(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn audio(&self) -> &[u8] {
        &self.audio
    }

    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFunctionCall {
    pub name: String,
    pub call_id: String,
    pub arguments: String,
}

/// How a server `error` event is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Commit of an empty input buffer; harmless.
    EmptyBuffer,
    /// A `response.create` raced an in-flight response.
    ActiveResponse,
    Unhandled,
}

impl ErrorClass {
    #[must_use]
    pub fn classify(message: &str) -> Self {
        if message.contains("buffer is empty") {
            Self::EmptyBuffer
        } else if message.contains("already has an active response") || message.contains("active response already") {
            Self::ActiveResponse
        } else {
            Self::Unhandled
        }
    }
}

/// Server-event state machine.
///
/// The only writer of the capture state and the response record. Every
/// branch is non-fatal; the only errors returned are transport send
/// failures.
pub struct Dispatcher {
    capture: CaptureBuffer,
    tools: Arc<ToolRegistry>,
    sink: Arc<dyn PlaybackSink>,
    latency: LatencyLog,
    transcript: Option<TranscriptObserver>,
    response: Option<ResponseState>,
    pending_call: Option<PendingFunctionCall>,
    turn_started: Option<Instant>,
    in_progress: bool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(capture: CaptureBuffer, tools: Arc<ToolRegistry>, sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            capture,
            tools,
            sink,
            latency: LatencyLog::disabled(),
            transcript: None,
            response: None,
            pending_call: None,
            turn_started: None,
            in_progress: false,
        }
    }

    #[must_use]
    pub fn with_latency_log(mut self, latency: LatencyLog) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_transcript(mut self, observer: TranscriptObserver) -> Self {
        self.transcript = Some(observer);
        self
    }

    #[must_use]
    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    #[must_use]
    pub const fn response(&self) -> Option<&ResponseState> {
        self.response.as_ref()
    }

    #[must_use]
    pub const fn pending_call(&self) -> Option<&PendingFunctionCall> {
        self.pending_call.as_ref()
    }

    #[must_use]
    pub const fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Forget per-connection state after the socket was replaced.
    pub fn reset(&mut self) {
        if self.response.take().is_some() {
            tracing::warn!("Dropping unfinished response after reconnect");
        }
        self.pending_call = None;
        self.turn_started = None;
        self.in_progress = false;
        self.capture.finish_receiving();
    }

    /// Apply one server event.
    ///
    /// # Errors
    /// Only when sending a reply over `transport` fails.
    pub async fn handle(&mut self, event: ServerEvent, transport: &mut dyn Transport) -> Result<()> {
        tracing::debug!(event_type = event.kind(), direction = "incoming", "Server event");
        match event {
            ServerEvent::ResponseCreated { response, .. } => {
                self.capture.begin_receiving();
                self.in_progress = true;
                if self.response.replace(ResponseState::new()).is_some() {
                    tracing::warn!(response_id = %response.id, "Response created while another was active");
                }
            }
            ServerEvent::ResponseOutputItemAdded { item, .. } => {
                if let Item::FunctionCall { name, call_id, .. } = item {
                    self.begin_function_call(name, call_id);
                }
            }
            ServerEvent::ResponseFunctionCallArgumentsDelta { delta, .. } => match self.pending_call.as_mut() {
                Some(call) => call.arguments.push_str(&delta),
                None => tracing::debug!("Dropping argument delta with no pending call"),
            },
            ServerEvent::ResponseFunctionCallArgumentsDone { arguments, .. } => {
                self.finish_function_call(&arguments, transport).await?;
            }
            ServerEvent::ResponseTextDelta { delta, .. } => match self.response.as_mut() {
                Some(response) => {
                    response.text.push_str(&delta);
                    if let Some(observer) = &self.transcript {
                        observer(&delta);
                    }
                }
                None => tracing::debug!("Dropping text delta with no active response"),
            },
            ServerEvent::ResponseAudioDelta { delta, .. } => self.append_audio(&delta),
            ServerEvent::ResponseAudioTranscriptDelta { delta, .. } => {
                if let Some(observer) = &self.transcript {
                    observer(&delta);
                }
            }
            ServerEvent::ResponseDone { .. } => self.finish_response().await,
            ServerEvent::InputAudioBufferSpeechStarted { audio_start_ms, .. } => {
                tracing::info!(audio_start_ms, "Speech detected, listening...");
            }
            ServerEvent::InputAudioBufferSpeechStopped { audio_end_ms, .. } => {
                self.capture.stop_capture();
                self.turn_started = Some(Instant::now());
                tracing::info!(audio_end_ms, "Speech ended, processing...");
                transport.send(ClientEvent::commit_audio()).await?;
            }
            ServerEvent::RateLimitsUpdated { .. } => {
                self.in_progress = false;
                self.capture.start_capture();
                tracing::info!("Resumed recording after rate_limits.updated");
            }
            ServerEvent::Error { error, .. } => self.handle_server_error(&error),
            ServerEvent::SessionCreated { .. } => tracing::info!("Session created"),
            ServerEvent::SessionUpdated { .. } => tracing::info!("Session configuration accepted"),
            ServerEvent::InputAudioBufferCommitted { item_id, .. } => {
                tracing::debug!(item_id = %item_id, "Input audio committed");
            }
            ServerEvent::ResponseOutputItemDone { .. }
            | ServerEvent::ResponseTextDone { .. }
            | ServerEvent::ResponseAudioDone { .. } => {}
            ServerEvent::Unknown(value) => {
                tracing::debug!(event_type = value.get("type").and_then(|kind| kind.as_str()).unwrap_or("?"), "Unhandled server event");
            }
        }
        Ok(())
    }

    fn begin_function_call(&mut self, name: String, call_id: String) {
        if self.response.is_none() {
            tracing::debug!(tool = %name, "Dropping function call with no active response");
            return;
        }
        let call = PendingFunctionCall {
            name,
            call_id,
            arguments: String::new(),
        };
        if let Some(previous) = self.pending_call.replace(call) {
            tracing::warn!(
                replaced_call_id = %previous.call_id,
                call_id = self.pending_call.as_ref().map_or("", |c| c.call_id.as_str()),
                "Function call started before the previous one finished; replacing it"
            );
        }
    }

    fn append_audio(&mut self, delta: &str) {
        let Some(response) = self.response.as_mut() else {
            tracing::debug!("Dropping audio delta with no active response");
            return;
        };
        match LENIENT.decode(delta.as_bytes()) {
            Ok(pcm) => response.audio.extend_from_slice(&pcm),
            Err(err) => tracing::warn!(error = %err, "Dropping undecodable audio delta"),
        }
    }

    async fn finish_function_call(&mut self, final_arguments: &str, transport: &mut dyn Transport) -> Result<()> {
        let Some(call) = self.pending_call.take() else {
            tracing::warn!("Function call arguments finished with no pending call");
            return Ok(());
        };

        let raw = if call.arguments.is_empty() { final_arguments } else { call.arguments.as_str() };
        let arguments = parse_arguments(raw);
        tracing::info!(tool = %call.name, call_id = %call.call_id, args = raw, "Function call");

        let started = Instant::now();
        let result = self
            .tools
            .dispatch(ToolCall {
                name: call.name.clone(),
                call_id: call.call_id,
                arguments,
            })
            .await;
        self.latency.record(&call.name, started.elapsed()).await;

        if let Some(message) = &result.error {
            transport.send(ClientEvent::create_item(Item::assistant_text(message.clone()))).await?;
        }
        let output = Item::function_output(result.call_id, result.output.to_string());
        transport.send(ClientEvent::create_item(output)).await?;
        transport.send(ClientEvent::create_response()).await?;
        Ok(())
    }

    async fn finish_response(&mut self) {
        if let Some(started) = self.turn_started.take() {
            self.latency.record(RESPONSE_LATENCY, started.elapsed()).await;
        }

        match self.response.take() {
            Some(response) => {
                tracing::info!(text = %response.text, audio_bytes = response.audio.len(), "Assistant response complete");
                if !response.audio.is_empty() {
                    if let Err(err) = self.sink.play(response.audio).await {
                        tracing::warn!(error = %err, "Playback failed");
                    }
                }
            }
            None => tracing::debug!("response.done with no active response"),
        }

        if let Some(call) = self.pending_call.take() {
            tracing::warn!(call_id = %call.call_id, "Discarding unfinished function call");
        }
        self.capture.finish_receiving();
    }

    fn handle_server_error(&mut self, error: &ServerError) {
        match ErrorClass::classify(&error.message) {
            ErrorClass::EmptyBuffer => {
                tracing::info!("Received 'buffer is empty' error, no audio data sent");
            }
            ErrorClass::ActiveResponse => {
                tracing::info!("Received 'active response' error, waiting for it to finish");
                self.in_progress = true;
            }
            ErrorClass::Unhandled => {
                tracing::error!(code = ?error.code, "Unhandled error: {}", error.message);
            }
        }
    }
}

/// Parse accumulated call arguments; anything but a JSON object becomes `{}`.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            tracing::warn!(args = raw, "Malformed function call arguments, using empty object");
            Value::Object(Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SilentSink;
    use crate::transport::{BoxFuture, ConnectionState};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<ClientEvent>,
    }

    impl Transport for Recorder {
        fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
            self.sent.push(event);
            Box::pin(async { Ok(()) })
        }

        fn next_event(&mut self) -> BoxFuture<'_, Result<ServerEvent>> {
            Box::pin(std::future::pending())
        }

        fn keepalive(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Active
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl PlaybackSink for RecordingSink {
        async fn play(&self, pcm: Vec<u8>) -> Result<()> {
            self.played.lock().push(pcm);
            Ok(())
        }
    }

    fn event(value: serde_json::Value) -> ServerEvent {
        serde_json::from_value(value).unwrap()
    }

    fn dispatcher_with(sink: Arc<dyn PlaybackSink>) -> (Dispatcher, CaptureBuffer) {
        let capture = CaptureBuffer::new();
        let dispatcher = Dispatcher::new(capture.clone(), Arc::new(ToolRegistry::new()), sink);
        (dispatcher, capture)
    }

    #[tokio::test]
    async fn unrecognized_events_are_ignored() {
        let (mut dispatcher, capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();
        capture.start_capture();

        for value in [
            json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": "hi"}),
            json!({"type": 42}),
        ] {
            dispatcher.handle(event(value), &mut transport).await.unwrap();
        }
        assert!(transport.sent.is_empty());
        assert!(!dispatcher.in_progress());
        assert_eq!(dispatcher.capture_state(), CaptureState::Recording);
    }

    #[tokio::test]
    async fn audio_deltas_are_played_once_on_done() {
        let sink = Arc::new(RecordingSink::default());
        let (mut dispatcher, capture) = dispatcher_with(sink.clone());
        let mut transport = Recorder::default();

        capture.start_capture();
        for value in [
            json!({"type": "response.created", "response": {"id": "resp_1"}}),
            json!({"type": "response.audio.delta", "delta": "AAA="}),
            json!({"type": "response.audio.delta", "delta": "BBB="}),
        ] {
            dispatcher.handle(event(value), &mut transport).await.unwrap();
        }
        assert_eq!(dispatcher.capture_state(), CaptureState::Receiving);
        assert_eq!(dispatcher.response().unwrap().audio().len(), 4);

        dispatcher
            .handle(event(json!({"type": "response.done", "response": {"id": "resp_1"}})), &mut transport)
            .await
            .unwrap();

        let played = sink.played.lock();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0], vec![0x00, 0x00, 0x04, 0x10]);
        assert_eq!(dispatcher.capture_state(), CaptureState::Idle);
        assert!(dispatcher.response().is_none());
        assert!(transport.sent.is_empty());
    }

    #[tokio::test]
    async fn text_deltas_accumulate_in_order_and_reach_observer() {
        let (dispatcher, _capture) = dispatcher_with(Arc::new(SilentSink));
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let mut dispatcher = dispatcher.with_transcript(Arc::new(move |delta: &str| sink.lock().push_str(delta)));
        let mut transport = Recorder::default();

        dispatcher
            .handle(event(json!({"type": "response.created", "response": {}})), &mut transport)
            .await
            .unwrap();
        for delta in ["There ", "are ", "3 nodes."] {
            dispatcher
                .handle(event(json!({"type": "response.text.delta", "delta": delta})), &mut transport)
                .await
                .unwrap();
        }

        assert_eq!(dispatcher.response().unwrap().text(), "There are 3 nodes.");
        assert_eq!(seen.lock().as_str(), "There are 3 nodes.");
    }

    #[tokio::test]
    async fn deltas_without_response_are_dropped() {
        let (mut dispatcher, _capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();

        dispatcher
            .handle(event(json!({"type": "response.text.delta", "delta": "stray"})), &mut transport)
            .await
            .unwrap();
        assert!(dispatcher.response().is_none());
    }

    #[tokio::test]
    async fn empty_buffer_error_has_no_side_effects() {
        let (mut dispatcher, capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();
        capture.start_capture();

        dispatcher
            .handle(
                event(json!({
                    "type": "error",
                    "error": {"type": "invalid_request_error", "message": "Error committing input audio buffer: the buffer is empty."}
                })),
                &mut transport,
            )
            .await
            .unwrap();

        assert_eq!(dispatcher.capture_state(), CaptureState::Recording);
        assert!(!dispatcher.in_progress());
        assert!(transport.sent.is_empty());
    }

    #[tokio::test]
    async fn active_response_error_marks_in_progress() {
        let (mut dispatcher, _capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();

        dispatcher
            .handle(
                event(json!({
                    "type": "error",
                    "error": {"type": "invalid_request_error", "message": "Conversation already has an active response"}
                })),
                &mut transport,
            )
            .await
            .unwrap();
        assert!(dispatcher.in_progress());

        dispatcher
            .handle(event(json!({"type": "rate_limits.updated", "rate_limits": []})), &mut transport)
            .await
            .unwrap();
        assert!(!dispatcher.in_progress());
        assert_eq!(dispatcher.capture_state(), CaptureState::Recording);
    }

    #[tokio::test]
    async fn unknown_tool_reports_error_then_output_then_response() {
        let (mut dispatcher, _capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();

        for value in [
            json!({"type": "response.created", "response": {"id": "resp_1"}}),
            json!({
                "type": "response.output_item.added",
                "response_id": "resp_1",
                "output_index": 0,
                "item": {"type": "function_call", "name": "no_such_tool", "call_id": "call_9", "arguments": ""}
            }),
            json!({"type": "response.function_call_arguments.delta", "call_id": "call_9", "delta": "{}"}),
            json!({"type": "response.function_call_arguments.done", "call_id": "call_9", "arguments": "{}"}),
        ] {
            dispatcher.handle(event(value), &mut transport).await.unwrap();
        }

        let kinds: Vec<_> = transport.sent.iter().map(ClientEvent::kind).collect();
        assert_eq!(
            kinds,
            ["conversation.item.create", "conversation.item.create", "response.create"]
        );
        let first = serde_json::to_value(&transport.sent[0]).unwrap();
        assert_eq!(first["item"]["role"], "assistant");
        assert_eq!(
            first["item"]["content"][0]["text"],
            "Function 'no_such_tool' not found. Add it to the tool registry."
        );
        let second = serde_json::to_value(&transport.sent[1]).unwrap();
        assert_eq!(second["item"]["type"], "function_call_output");
        assert_eq!(second["item"]["call_id"], "call_9");
        let output: serde_json::Value = serde_json::from_str(second["item"]["output"].as_str().unwrap()).unwrap();
        assert!(output["error"].as_str().unwrap().contains("not found"));
        assert!(dispatcher.pending_call().is_none());
    }

    #[tokio::test]
    async fn registered_tool_output_is_sent_without_error_message() {
        let capture = CaptureBuffer::new();
        let mut tools = ToolRegistry::new();
        tools.raw_tool("echo_ns", "Echo namespace", json!({"type": "object"}), |args| async move {
            Ok::<_, crate::Error>(json!({"ns": args["ns"]}))
        });
        let mut dispatcher = Dispatcher::new(capture, Arc::new(tools), Arc::new(SilentSink));
        let mut transport = Recorder::default();

        for value in [
            json!({"type": "response.created", "response": {}}),
            json!({
                "type": "response.output_item.added",
                "item": {"type": "function_call", "name": "echo_ns", "call_id": "call_1", "arguments": ""}
            }),
            json!({"type": "response.function_call_arguments.delta", "call_id": "call_1", "delta": "{\"ns\":"}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "call_1", "delta": "\"kube-system\"}"}),
            json!({"type": "response.function_call_arguments.done", "call_id": "call_1", "arguments": ""}),
        ] {
            dispatcher.handle(event(value), &mut transport).await.unwrap();
        }

        assert_eq!(transport.sent.len(), 2);
        let output = serde_json::to_value(&transport.sent[0]).unwrap();
        assert_eq!(output["item"]["output"], "{\"ns\":\"kube-system\"}");
        assert_eq!(transport.sent[1].kind(), "response.create");
    }

    #[tokio::test]
    async fn second_function_call_replaces_pending_one() {
        let (mut dispatcher, _capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();

        for value in [
            json!({"type": "response.created", "response": {}}),
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "name": "a", "call_id": "call_a", "arguments": ""}}),
            json!({"type": "response.function_call_arguments.delta", "call_id": "call_a", "delta": "{\"x\":1"}),
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "name": "b", "call_id": "call_b", "arguments": ""}}),
        ] {
            dispatcher.handle(event(value), &mut transport).await.unwrap();
        }

        let pending = dispatcher.pending_call().unwrap();
        assert_eq!(pending.call_id, "call_b");
        assert!(pending.arguments.is_empty());
    }

    #[tokio::test]
    async fn speech_stopped_commits_and_stops_capture() {
        let (mut dispatcher, capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();
        capture.start_capture();

        dispatcher
            .handle(
                event(json!({"type": "input_audio_buffer.speech_stopped", "audio_end_ms": 1200, "item_id": "item_1"})),
                &mut transport,
            )
            .await
            .unwrap();

        assert_eq!(dispatcher.capture_state(), CaptureState::Idle);
        assert_eq!(transport.sent, vec![ClientEvent::commit_audio()]);
    }

    #[tokio::test]
    async fn rate_limits_during_response_resume_after_done() {
        let (mut dispatcher, _capture) = dispatcher_with(Arc::new(SilentSink));
        let mut transport = Recorder::default();

        for value in [
            json!({"type": "response.created", "response": {}}),
            json!({"type": "rate_limits.updated", "rate_limits": [{"name": "tokens", "limit": 100, "remaining": 90, "reset_seconds": 1.5}]}),
        ] {
            dispatcher.handle(event(value), &mut transport).await.unwrap();
        }
        assert_eq!(dispatcher.capture_state(), CaptureState::Receiving);

        dispatcher
            .handle(event(json!({"type": "response.done", "response": {}})), &mut transport)
            .await
            .unwrap();
        assert_eq!(dispatcher.capture_state(), CaptureState::Recording);
    }

    #[tokio::test]
    async fn response_latency_is_recorded_from_speech_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.jsonl");
        let (dispatcher, _capture) = dispatcher_with(Arc::new(SilentSink));
        let mut dispatcher = dispatcher.with_latency_log(LatencyLog::to_file(&path));
        let mut transport = Recorder::default();

        for value in [
            json!({"type": "input_audio_buffer.speech_stopped", "audio_end_ms": 10}),
            json!({"type": "response.created", "response": {}}),
            json!({"type": "response.done", "response": {}}),
        ] {
            dispatcher.handle(event(value), &mut transport).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"function\":\"realtime_api_response\""));
    }

    #[test]
    fn error_classification() {
        assert_eq!(ErrorClass::classify("the input audio buffer is empty"), ErrorClass::EmptyBuffer);
        assert_eq!(
            ErrorClass::classify("Conversation already has an active response"),
            ErrorClass::ActiveResponse
        );
        assert_eq!(ErrorClass::classify("Invalid value: 'foo'"), ErrorClass::Unhandled);
    }

    #[test]
    fn arguments_fall_back_to_empty_object() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(parse_arguments("{\"ns\":"), serde_json::json!({}));
        assert_eq!(parse_arguments("[1,2]"), serde_json::json!({}));
        assert_eq!(parse_arguments("{\"ns\":\"default\"}"), serde_json::json!({"ns": "default"}));
    }
}
