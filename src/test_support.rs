//! Scripted collaborators for unit tests

use crate::playback::PlaybackError;
use crate::services::{
    AudioOutput, AudioSink, ChatCompletion, CompletionRequest, EncodedAudio, Result,
    ServiceError, SpeechSynthesizer, SpeechToText, TtsStream,
};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Speech-to-text that answers from a script, then with empty text
pub struct ScriptedStt {
    script: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<EncodedAudio>>,
}

impl ScriptedStt {
    pub fn new(script: Vec<Result<String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<EncodedAudio> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, audio: &EncodedAudio) -> Result<String> {
        self.requests.lock().unwrap().push(audio.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(String::new()))
    }
}

/// Chat completion with separate scripts for blocking and streaming calls.
///
/// Blocking calls default to "YES", streaming calls to "Okay.".
pub struct ScriptedChat {
    answers: Mutex<VecDeque<Result<String>>>,
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Duration,
}

impl ScriptedChat {
    pub fn new(answers: Vec<Result<String>>, replies: Vec<Result<String>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Make every call take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    async fn answer(
        &self,
        request: CompletionRequest,
        script: &Mutex<VecDeque<Result<String>>>,
        default: &str,
    ) -> Result<String> {
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(default.to_string()))
    }
}

#[async_trait]
impl ChatCompletion for ScriptedChat {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.answer(request, &self.answers, "YES").await
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let reply = self.answer(request, &self.replies, "Okay.").await?;
        let deltas: Vec<Result<String>> = reply
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(stream::iter(deltas).boxed())
    }
}

#[derive(Debug, Default)]
struct TtsLog {
    texts: Vec<String>,
    cancelled: usize,
    closed: usize,
}

/// TTS that yields `chunks` buffers of 100 ms silence, one per `interval`
pub struct ScriptedTts {
    chunks: usize,
    interval: Duration,
    fail_after: Option<usize>,
    log: Arc<Mutex<TtsLog>>,
}

impl ScriptedTts {
    pub fn new(chunks: usize, interval: Duration) -> Self {
        Self {
            chunks,
            interval,
            fail_after: None,
            log: Arc::default(),
        }
    }

    /// Fail the stream after `n` chunks were delivered.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn texts(&self) -> Vec<String> {
        self.log.lock().unwrap().texts.clone()
    }

    pub fn cancelled(&self) -> usize {
        self.log.lock().unwrap().cancelled
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedTts {
    async fn open(&self, text: &str) -> Result<Box<dyn TtsStream>> {
        self.log.lock().unwrap().texts.push(text.to_string());
        Ok(Box::new(ScriptedTtsStream {
            remaining: self.chunks,
            sent: 0,
            interval: self.interval,
            fail_after: self.fail_after,
            log: self.log.clone(),
            closed: false,
        }))
    }
}

struct ScriptedTtsStream {
    remaining: usize,
    sent: usize,
    interval: Duration,
    fail_after: Option<usize>,
    log: Arc<Mutex<TtsLog>>,
    closed: bool,
}

#[async_trait]
impl TtsStream for ScriptedTtsStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.fail_after == Some(self.sent) {
            return Err(ServiceError::ConnectionClosed);
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        tokio::time::sleep(self.interval).await;
        self.remaining -= 1;
        self.sent += 1;
        Ok(Some(vec![0u8; 3200]))
    }

    async fn cancel(&mut self) -> Result<()> {
        self.remaining = 0;
        self.log.lock().unwrap().cancelled += 1;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().unwrap().closed += 1;
        }
    }
}

/// Lifecycle events seen by [`RecordingOutput`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    Opened,
    Finished,
    Stopped,
}

#[derive(Debug, Default)]
struct OutputState {
    open: bool,
    events: Vec<OutputEvent>,
    write_times: Vec<Instant>,
    busy_rejections: usize,
}

/// Exclusive output device that records what happens to it
#[derive(Default)]
pub struct RecordingOutput {
    state: Arc<Mutex<OutputState>>,
    drain_time: Duration,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `finish` take `drain_time` to play out the queued audio.
    pub fn with_drain_time(mut self, drain_time: Duration) -> Self {
        self.drain_time = drain_time;
        self
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn write_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().write_times.clone()
    }

    pub fn chunks_written(&self) -> usize {
        self.state.lock().unwrap().write_times.len()
    }

    pub fn busy_rejections(&self) -> usize {
        self.state.lock().unwrap().busy_rejections
    }
}

impl AudioOutput for RecordingOutput {
    fn open(&self) -> std::result::Result<Box<dyn AudioSink>, PlaybackError> {
        let mut state = self.state.lock().unwrap();
        if state.open {
            state.busy_rejections += 1;
            return Err(PlaybackError::DeviceBusy);
        }
        state.open = true;
        state.events.push(OutputEvent::Opened);
        Ok(Box::new(RecordingSink {
            state: self.state.clone(),
            drain_time: self.drain_time,
            closed: false,
        }))
    }
}

struct RecordingSink {
    state: Arc<Mutex<OutputState>>,
    drain_time: Duration,
    closed: bool,
}

impl RecordingSink {
    fn close(&mut self, event: OutputEvent) {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.lock().unwrap();
            state.open = false;
            state.events.push(event);
        }
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn write(&mut self, _pcm: &[u8]) -> std::result::Result<(), PlaybackError> {
        self.state.lock().unwrap().write_times.push(Instant::now());
        Ok(())
    }

    async fn finish(&mut self) -> std::result::Result<(), PlaybackError> {
        if !self.drain_time.is_zero() {
            tokio::time::sleep(self.drain_time).await;
        }
        self.close(OutputEvent::Finished);
        Ok(())
    }

    async fn stop(&mut self) {
        self.close(OutputEvent::Stopped);
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        self.close(OutputEvent::Stopped);
    }
}
