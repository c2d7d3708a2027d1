//! Runtime configuration, read from the process environment
//!
//! A `.env` file in the working directory is loaded first when present.

use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the energy-based speech segmenter
#[derive(Debug, Clone)]
pub struct SegConfig {
    /// Sample rate of incoming frames
    pub sample_rate: u32,

    /// Energy window length in milliseconds
    pub window_ms: u64,

    /// Distance between consecutive window starts in milliseconds
    pub step_ms: u64,

    /// Number of trailing windows whose maximum is the decision statistic
    pub decision_windows: usize,

    /// Statistic above which a window counts as speech
    pub energy_threshold: f32,

    /// Continuous sub-threshold time required to close a segment
    pub min_silence_ms: u64,

    /// Pre-roll kept in front of the detected onset
    pub lookback_ms: u64,

    /// Bound of the rolling buffer in seconds
    pub max_buffer_secs: u64,
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            window_ms: 250,
            step_ms: 100,
            decision_windows: 3,
            energy_threshold: 3840.0, // 15 on an 8-bit scale
            min_silence_ms: 800,
            lookback_ms: 500,
            max_buffer_secs: 10,
        }
    }
}

impl SegConfig {
    fn samples_for_ms(&self, ms: u64) -> usize {
        (self.sample_rate as u64 * ms / 1000) as usize
    }

    pub fn window_samples(&self) -> usize {
        self.samples_for_ms(self.window_ms).max(1)
    }

    pub fn step_samples(&self) -> usize {
        self.samples_for_ms(self.step_ms).max(1)
    }

    pub fn min_silence_samples(&self) -> u64 {
        self.samples_for_ms(self.min_silence_ms) as u64
    }

    pub fn lookback_samples(&self) -> usize {
        self.samples_for_ms(self.lookback_ms)
    }

    pub fn max_buffer_samples(&self) -> usize {
        (self.sample_rate as u64 * self.max_buffer_secs) as usize
    }
}

/// Configuration for the Groq speech-to-text and chat completion endpoints
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: String,
    pub base_url: String,

    /// Model used for both reply generation and completeness checks
    pub model: String,

    /// Token budget of a generated reply
    pub reply_max_tokens: u32,

    /// Token budget of a completeness check
    pub classifier_max_tokens: u32,

    pub stt_model: String,
    pub language: String,
    pub request_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            reply_max_tokens: 1024,
            classifier_max_tokens: 1,
            stt_model: "whisper-large-v3".to_string(),
            language: "en".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the Cartesia websocket text-to-speech service
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub api_key: String,
    pub url: String,
    pub api_version: String,
    pub model_id: String,
    pub voice_id: String,
    pub sample_rate: u32,
    pub encoding: String,

    /// Bound of the inbound audio chunk queue
    pub chunk_queue: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: "wss://api.cartesia.ai/tts/websocket".to_string(),
            api_version: "2024-06-10".to_string(),
            model_id: "sonic-english".to_string(),
            voice_id: "1001d611-b1a8-46bd-a5ca-551b23505334".to_string(),
            sample_rate: 16_000,
            encoding: "pcm_s16le".to_string(),
            chunk_queue: 32,
        }
    }
}

/// Names used in the dialogue persona
#[derive(Debug, Clone)]
pub struct Persona {
    pub user_name: String,
    pub agent_name: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            user_name: "User".to_string(),
            agent_name: "Max".to_string(),
        }
    }
}

impl Persona {
    /// How a user utterance is recorded in the dialogue history
    pub fn speaker_line(&self, text: &str) -> String {
        format!("{}: {}", self.user_name, text)
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub seg: SegConfig,
    pub chat: ChatConfig,
    pub tts: TtsConfig,
    pub persona: Persona,

    /// Capacity of the capture hand-off queue, in frames
    pub frame_queue: usize,

    /// Samples per captured frame
    pub frame_samples: usize,
}

impl AgentConfig {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded environment from {}", path.display()),
            Err(e) => debug!("No .env file loaded: {}", e),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AgentConfig {
            frame_queue: 64,
            frame_samples: 1600,
            ..Default::default()
        };

        config.chat.api_key = required(&lookup, "GROQ_API_KEY")?;
        config.tts.api_key = required(&lookup, "CARTESIA_API_KEY")?;

        if let Some(name) = lookup("AGENT_USER_NAME") {
            config.persona.user_name = name;
        }
        if let Some(name) = lookup("AGENT_NAME") {
            config.persona.agent_name = name;
        }
        if let Some(model) = lookup("AGENT_CHAT_MODEL") {
            config.chat.model = model;
        }
        if let Some(model) = lookup("AGENT_STT_MODEL") {
            config.chat.stt_model = model;
        }
        if let Some(voice) = lookup("AGENT_TTS_VOICE") {
            config.tts.voice_id = voice;
        }
        if let Some(model) = lookup("AGENT_TTS_MODEL") {
            config.tts.model_id = model;
        }

        if let Some(v) = parsed(&lookup, "AGENT_ENERGY_THRESHOLD")? {
            config.seg.energy_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "AGENT_MIN_SILENCE_MS")? {
            config.seg.min_silence_ms = v;
        }
        if let Some(v) = parsed(&lookup, "AGENT_LOOKBACK_MS")? {
            config.seg.lookback_ms = v;
        }
        if let Some(v) = parsed(&lookup, "AGENT_MAX_BUFFER_SECS")? {
            config.seg.max_buffer_secs = v;
        }

        Ok(config)
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parsed<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
