//! Audio segmentation module
//!
//! Energy-based voice activity detection over a bounded rolling buffer.
//! Each incoming frame is appended to the buffer, a sliding-window energy
//! statistic is computed over its tail, and a small state machine turns the
//! statistic into speech onsets and finished [`SpeechSegment`]s.
//!
//! The window metric is `(mean(|x|) + max(|x|)) / 2`; the decision statistic
//! is the maximum metric over the last few windows. A segment is closed once
//! the statistic has stayed at or below the threshold for the configured
//! minimum silence, measured on the audio clock (samples seen).

use crate::barge_in::BargeInSignal;
use crate::config::SegConfig;
use crate::events::{CloseReason, SpeechSegment};
use std::collections::VecDeque;
use tracing::{debug, info, span, Level};

/// Events produced by the segmenter
#[derive(Debug, Clone)]
pub enum SegmenterEvent {
    /// Speech onset; `start_sample` already includes the lookback
    SpeechStarted { start_sample: u64 },

    /// A speech burst ended and was cut out of the buffer
    SpeechEnded(SpeechSegment),
}

/// Append-only sample buffer bounded to a maximum length.
///
/// Positions are absolute: `offset` is the position of the oldest retained
/// sample, so positions handed out stay valid across trimming.
#[derive(Debug)]
pub struct RollingAudioBuffer {
    samples: VecDeque<i16>,
    offset: u64,
    max_samples: usize,
}

impl RollingAudioBuffer {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            offset: 0,
            max_samples,
        }
    }

    pub fn push(&mut self, pcm: &[i16]) {
        self.samples.extend(pcm.iter().copied());
    }

    /// Drop the oldest samples over the bound, but never samples at or
    /// after `keep_from`.
    pub fn trim(&mut self, keep_from: Option<u64>) {
        if self.samples.len() <= self.max_samples {
            return;
        }
        let mut excess = self.samples.len() - self.max_samples;
        if let Some(keep_from) = keep_from {
            let protected = keep_from.saturating_sub(self.offset) as usize;
            excess = excess.min(protected);
        }
        self.samples.drain(..excess);
        self.offset += excess as u64;
    }

    /// Forget everything retained so far.
    pub fn clear(&mut self) {
        self.offset += self.samples.len() as u64;
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Absolute position of the oldest retained sample
    pub fn start(&self) -> u64 {
        self.offset
    }

    /// Absolute position one past the newest sample
    pub fn end(&self) -> u64 {
        self.offset + self.samples.len() as u64
    }

    /// Copy out the samples in `[from, to)`, clamped to what is retained.
    pub fn slice(&self, from: u64, to: u64) -> Vec<i16> {
        let from = from.clamp(self.start(), self.end());
        let to = to.clamp(from, self.end());
        let a = (from - self.offset) as usize;
        let b = (to - self.offset) as usize;
        self.samples.range(a..b).copied().collect()
    }

    /// `(mean(|x|) + max(|x|)) / 2` over `len` samples starting at buffer index `at`.
    fn window_energy(&self, at: usize, len: usize) -> f32 {
        let mut sum = 0u64;
        let mut peak = 0u16;
        for sample in self.samples.range(at..at + len) {
            let magnitude = sample.unsigned_abs();
            sum += magnitude as u64;
            peak = peak.max(magnitude);
        }
        let mean = sum as f32 / len as f32;
        (mean + peak as f32) / 2.0
    }

    /// Maximum window energy over the last `count` windows of the sliding grid.
    ///
    /// Window starts are `0, step, 2*step, ...` strictly below `len - window`.
    /// Returns `None` until the buffer holds more than one window.
    pub fn decision_statistic(&self, window: usize, step: usize, count: usize) -> Option<f32> {
        let len = self.samples.len();
        if len <= window || count == 0 {
            return None;
        }
        let windows = (len - window).div_ceil(step);
        let first = windows.saturating_sub(count);
        (first..windows)
            .map(|i| self.window_energy(i * step, window))
            .reduce(f32::max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Idle,
    Speaking {
        /// Fixed at onset, never revised during the episode
        start: u64,
        /// Buffer end at the first sub-threshold frame of the current pause
        silence_since: Option<u64>,
    },
}

/// Voice activity segmenter that turns frames into speech segments
pub struct AudioSegmenter {
    cfg: SegConfig,
    buffer: RollingAudioBuffer,
    state: State,
    barge_in: BargeInSignal,
    next_seq: u64,
}

impl AudioSegmenter {
    pub fn new(cfg: SegConfig, barge_in: BargeInSignal) -> Self {
        let buffer = RollingAudioBuffer::new(cfg.max_buffer_samples());
        Self {
            cfg,
            buffer,
            state: State::Idle,
            barge_in,
            next_seq: 0,
        }
    }

    /// Process one frame of PCM audio and report any state transition.
    pub fn push_frame(&mut self, pcm: &[i16]) -> Option<SegmenterEvent> {
        self.ingest(pcm, None)
    }

    fn ingest(&mut self, pcm: &[i16], statistic: Option<f32>) -> Option<SegmenterEvent> {
        let _span = span!(Level::DEBUG, "segment.push_frame").entered();

        self.buffer.push(pcm);

        let statistic = statistic.or_else(|| {
            self.buffer.decision_statistic(
                self.cfg.window_samples(),
                self.cfg.step_samples(),
                self.cfg.decision_windows,
            )
        });

        let mut event = statistic.and_then(|energy| {
            debug!("Current energy: {:.1}", energy);
            self.on_statistic(energy)
        });

        // A burst as long as the whole buffer is cut here so the bound holds.
        if event.is_none() {
            if let State::Speaking { start, .. } = self.state {
                if self.buffer.end() - start >= self.buffer.max_samples() as u64 {
                    debug!("Closing segment at buffer bound");
                    event = self.finalize_segment(CloseReason::MaxLength);
                }
            }
        }

        let keep_from = match self.state {
            State::Speaking { start, .. } => Some(start),
            State::Idle => None,
        };
        self.buffer.trim(keep_from);

        event
    }

    fn on_statistic(&mut self, energy: f32) -> Option<SegmenterEvent> {
        let now = self.buffer.end();

        if energy > self.cfg.energy_threshold {
            match &mut self.state {
                State::Idle => {
                    let lookback = self.cfg.lookback_samples() as u64;
                    let start = now.saturating_sub(lookback).max(self.buffer.start());
                    info!("Speech started (energy {:.1})", energy);
                    self.state = State::Speaking { start, silence_since: None };
                    self.barge_in.trigger();
                    return Some(SegmenterEvent::SpeechStarted { start_sample: start });
                }
                State::Speaking { silence_since, .. } => {
                    if silence_since.take().is_some() {
                        debug!("Speech resumed before minimum silence");
                    }
                }
            }
            return None;
        }

        if let State::Speaking { silence_since, .. } = &mut self.state {
            match *silence_since {
                None => *silence_since = Some(now),
                Some(since) if now - since >= self.cfg.min_silence_samples() => {
                    info!("Speech ended after {}ms of silence", self.cfg.min_silence_ms);
                    return self.finalize_segment(CloseReason::Silence);
                }
                Some(_) => {}
            }
        }

        None
    }

    /// Cut the current episode out of the buffer and reset detection state
    fn finalize_segment(&mut self, reason: CloseReason) -> Option<SegmenterEvent> {
        let State::Speaking { start, .. } = self.state else {
            return None;
        };

        let end = self.buffer.end();
        let segment = SpeechSegment {
            seq: self.next_seq,
            start_sample: start,
            end_sample: end,
            pcm: self.buffer.slice(start, end),
            sample_rate: self.cfg.sample_rate,
            close_reason: reason,
        };
        self.next_seq += 1;

        self.reset_state();
        self.barge_in.clear();

        debug!(
            "Segment #{} closed by {:?}: {:.2}s",
            segment.seq,
            reason,
            segment.duration_secs()
        );
        Some(SegmenterEvent::SpeechEnded(segment))
    }

    fn reset_state(&mut self) {
        self.state = State::Idle;
        self.buffer.clear();
    }

    /// Check if a speech episode is currently open
    pub fn is_capturing(&self) -> bool {
        matches!(self.state, State::Speaking { .. })
    }

    /// Get the number of samples in the rolling buffer
    pub fn buffer_samples(&self) -> usize {
        self.buffer.len()
    }

    /// Get the rolling buffer duration in seconds
    pub fn buffer_duration(&self) -> f32 {
        self.buffer.len() as f32 / self.cfg.sample_rate as f32
    }
}

/// Convert little-endian u8 bytes to i16 PCM samples
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}
