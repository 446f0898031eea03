use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::models::{
    AudioFormat, DEFAULT_MODEL, Modality, SessionUpdate, Tool, ToolChoice, ToolChoiceMode, TurnDetection, Voice,
};
use crate::{Error, Result};

pub const DEFAULT_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_VOICE: &str = "alloy";
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_CHUNK_FRAMES: u32 = 1024;

pub const DEFAULT_INSTRUCTIONS: &str = "You are Kuby, a helpful assistant. Respond to Pat. \
Keep all of your responses short. Say things like: 'Task complete', 'There was an error', \
'I need more information'.";

const API_KEY_VAR: &str = "OPENAI_API_KEY";
const MODEL_VAR: &str = "KUBEWHISPER_MODEL";
const VOICE_VAR: &str = "KUBEWHISPER_VOICE";
const URL_VAR: &str = "KUBEWHISPER_URL";

/// Connection parameters for one socket. Cloned into every reconnect attempt.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub api_key: String,
    pub url: String,
    pub model: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub close_timeout: Duration,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: DEFAULT_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(120),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("api_key", &"<redacted>")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

/// Server-side voice activity detection parameters.
///
/// Validated once on construction and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnDetectionConfig {
    threshold: f32,
    prefix_padding_ms: u32,
    silence_duration_ms: u32,
}

impl TurnDetectionConfig {
    /// # Errors
    /// Returns `InvalidConfig` when `threshold` is outside `0.0..=1.0`.
    pub fn new(threshold: f32, prefix_padding_ms: u32, silence_duration_ms: u32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "turn detection threshold must be within 0.0..=1.0, got {threshold}"
            )));
        }
        Ok(Self {
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
        })
    }

    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    #[must_use]
    pub const fn prefix_padding_ms(&self) -> u32 {
        self.prefix_padding_ms
    }

    #[must_use]
    pub const fn silence_duration_ms(&self) -> u32 {
        self.silence_duration_ms
    }
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 700,
        }
    }
}

impl From<TurnDetectionConfig> for TurnDetection {
    fn from(config: TurnDetectionConfig) -> Self {
        Self::ServerVad {
            threshold: Some(config.threshold),
            prefix_padding_ms: Some(config.prefix_padding_ms),
            silence_duration_ms: Some(config.silence_duration_ms),
            create_response: None,
        }
    }
}

/// What the session asks of the server on every (re)connect.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub modalities: Vec<Modality>,
    pub instructions: String,
    pub voice: Voice,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub turn_detection: TurnDetectionConfig,
    pub temperature: Option<f32>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            modalities: vec![Modality::Text, Modality::Audio],
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            voice: Voice::from(DEFAULT_VOICE),
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            turn_detection: TurnDetectionConfig::default(),
            temperature: None,
        }
    }
}

impl SessionSettings {
    /// Build the `session.update` payload advertising `tools`.
    #[must_use]
    pub fn to_update(&self, tools: Vec<Tool>) -> SessionUpdate {
        let tool_choice = (!tools.is_empty()).then_some(ToolChoice::Mode(ToolChoiceMode::Auto));
        SessionUpdate {
            modalities: Some(self.modalities.clone()),
            instructions: Some(self.instructions.clone()),
            voice: Some(self.voice.clone()),
            input_audio_format: Some(self.input_audio_format),
            output_audio_format: Some(self.output_audio_format),
            turn_detection: Some(self.turn_detection.into()),
            tools: Some(tools),
            tool_choice,
            temperature: self.temperature,
        }
    }
}

/// Process-wide configuration, built once at startup and handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub session: SessionSettings,
    /// Capture and playback sample rate; must match the PCM16 session format.
    pub sample_rate: u32,
    pub chunk_frames: u32,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    /// Text turns sent instead of starting the microphone.
    pub initial_prompts: Vec<String>,
    pub latency_log: Option<PathBuf>,
}

impl Config {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(api_key),
            session: SessionSettings::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            poll_interval: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(1),
            initial_prompts: Vec::new(),
            latency_log: None,
        }
    }

    /// Read configuration from the process environment.
    ///
    /// # Errors
    /// Returns `Auth` when `OPENAI_API_KEY` is unset or blank.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[allow(clippy::result_large_err)]
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup(API_KEY_VAR)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| Error::Auth(format!("{API_KEY_VAR} is not set")))?;

        let mut config = Self::new(api_key);
        if let Some(model) = lookup(MODEL_VAR) {
            config = config.model(model);
        }
        if let Some(voice) = lookup(VOICE_VAR) {
            config = config.voice(voice);
        }
        if let Some(url) = lookup(URL_VAR) {
            config = config.url(url);
        }
        Ok(config)
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.connection.model = model.into();
        self
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.connection.url = url.into();
        self
    }

    #[must_use]
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.session.voice = Voice::from(voice.into());
        self
    }

    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.session.instructions = instructions.into();
        self
    }

    #[must_use]
    pub const fn turn_detection(mut self, turn_detection: TurnDetectionConfig) -> Self {
        self.session.turn_detection = turn_detection;
        self
    }

    #[must_use]
    pub fn text_only(mut self) -> Self {
        self.session.modalities = vec![Modality::Text];
        self
    }

    #[must_use]
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompts.push(prompt.into());
        self
    }

    #[must_use]
    pub fn latency_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.latency_log = Some(path.into());
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn keepalive(mut self, ping_interval: Duration, ping_timeout: Duration) -> Self {
        self.connection.ping_interval = ping_interval;
        self.connection.ping_timeout = ping_timeout;
        self
    }
}
