//! Segment transcription
//!
//! Encodes a [`SpeechSegment`] as an in-memory WAV file and hands it to the
//! speech-to-text service. Any failure degrades to an empty transcript so the
//! segment is simply dropped by the caller.

use crate::events::SpeechSegment;
use crate::services::{EncodedAudio, Result, SpeechToText};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Encode 16-bit mono PCM as a complete WAV file.
pub fn encode_wav(pcm: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + pcm.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for sample in pcm {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Converts speech segments to text through an injected STT service
#[derive(Clone)]
pub struct TranscriptionClient {
    stt: Arc<dyn SpeechToText>,
    language: String,
}

impl TranscriptionClient {
    pub fn new(stt: Arc<dyn SpeechToText>, language: impl Into<String>) -> Self {
        Self {
            stt,
            language: language.into(),
        }
    }

    /// Transcribe a segment. Returns an empty string on any failure.
    pub async fn transcribe(&self, segment: &SpeechSegment) -> String {
        let started = Instant::now();
        match self.try_transcribe(segment).await {
            Ok(text) => {
                let text = text.trim().to_string();
                debug!(
                    "Segment #{} ({:.2}s) transcribed in {}ms: {:?}",
                    segment.seq,
                    segment.duration_secs(),
                    started.elapsed().as_millis(),
                    text
                );
                text
            }
            Err(e) => {
                warn!("Transcription of segment #{} failed: {}", segment.seq, e);
                String::new()
            }
        }
    }

    async fn try_transcribe(&self, segment: &SpeechSegment) -> Result<String> {
        let audio = EncodedAudio {
            wav: encode_wav(&segment.pcm, segment.sample_rate)?,
            sample_rate: segment.sample_rate,
            channels: 1,
            language: self.language.clone(),
        };
        self.stt.transcribe(&audio).await
    }
}
