//! Shared data model passed between the pipeline stages

use serde::{Deserialize, Serialize};

/// A fixed-size block of 16-bit mono PCM samples, in arrival order
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Vec<i16>,
}

impl AudioFrame {
    pub fn new(pcm: Vec<i16>) -> Self {
        Self { pcm }
    }
}

/// Reason a speech segment was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Trailing silence reached the minimum silence duration
    Silence,

    /// The segment grew to the rolling buffer bound while speech continued
    MaxLength,
}

/// One continuous burst of speech, including the pre-speech lookback
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Monotonic segment number, assigned in emission order
    pub seq: u64,

    /// Absolute sample position of the first sample (lookback included)
    pub start_sample: u64,

    /// Absolute sample position one past the last sample
    pub end_sample: u64,

    /// The PCM audio of the segment (16-bit mono)
    pub pcm: Vec<i16>,

    pub sample_rate: u32,

    pub close_reason: CloseReason,
}

impl SpeechSegment {
    /// Duration of the segment in seconds
    pub fn duration_secs(&self) -> f32 {
        self.pcm.len() as f32 / self.sample_rate as f32
    }
}

/// A finished conversational exchange, consumed exactly once by playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub seq: u64,
    pub transcript: String,
    pub reply: String,
}

/// Speaker role of a dialogue message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single (role, content) entry in the dialogue history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
