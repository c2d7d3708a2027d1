//! Boundaries to the external collaborators
//!
//! Speech-to-text, text completion, text-to-speech and the audio output
//! device are reached only through these traits, so the pipeline can be
//! driven by real network clients or by scripted fakes.

use crate::events::ChatMessage;
use crate::playback::PlaybackError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Error type for external service calls
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audio encoding error: {0}")]
    Encoding(#[from] hound::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// An encoded audio clip ready for upload
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    /// Complete WAV file bytes
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Language hint, e.g. "en"
    pub language: String,
}

/// A completion request: history with system preamble first, and a token budget
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &EncodedAudio) -> Result<String>;
}

#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Generate the whole reply at once.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Generate the reply as a pull-based sequence of text deltas.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Open a synthesis session for `text`. Each call owns its own connection.
    async fn open(&self, text: &str) -> Result<Box<dyn TtsStream>>;
}

/// One live synthesis session, pulled chunk by chunk.
#[async_trait]
pub trait TtsStream: Send {
    /// Next raw PCM buffer, or `None` once the service reports completion.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;

    /// Ask the service to stop generating. Pending chunks are dropped.
    async fn cancel(&mut self) -> Result<()>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// The exclusive playback device
pub trait AudioOutput: Send + Sync {
    /// Open the device. Fails while another sink is still open.
    fn open(&self) -> std::result::Result<Box<dyn AudioSink>, PlaybackError>;
}

/// An open playback stream. Dropping a sink stops it and releases the device.
#[async_trait]
pub trait AudioSink: Send {
    async fn write(&mut self, pcm: &[u8]) -> std::result::Result<(), PlaybackError>;

    /// Play out everything written so far, then release the device.
    async fn finish(&mut self) -> std::result::Result<(), PlaybackError>;

    /// Discard queued audio and release the device.
    ///
    /// Returns once the device can be opened again.
    async fn stop(&mut self);
}
