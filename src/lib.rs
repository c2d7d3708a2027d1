//! Turnkeeper - a spoken dialogue agent
//!
//! Microphone audio is cut into speech segments by an energy detector,
//! transcribed, accumulated into an utterance and checked for completeness.
//! Finished turns get a short generated reply that is spoken back, and
//! playback stops as soon as the user starts talking again.

#![forbid(unsafe_code)]

/// PulseAudio capture and playback devices
#[cfg(feature = "pulse")]
pub mod audio;
/// Energy-based speech segmentation over a rolling buffer
pub mod audio_seg;
pub mod barge_in;
pub mod capture;
/// Cartesia websocket text-to-speech
pub mod cartesia;
pub mod config;
pub mod events;
/// Groq wire types
pub mod groq;
/// Groq HTTP client
pub mod groq_client;
pub mod orchestrator;
pub mod playback;
pub mod services;
pub mod session;
pub mod transcription;
pub mod utterance;

#[cfg(test)]
mod test_support;
