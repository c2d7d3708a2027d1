//! Top-level pipeline
//!
//! capture thread -> segmenter loop -> turn orchestrator -> playback
//!
//! The segmenter loop, the orchestrator and the playback controller run as
//! separate tasks joined by bounded queues. The segmenter loop never waits on
//! the segment queue, so a hung external call cannot stop frame ingestion or
//! barge-in detection; segments that find the queue full are dropped.
//!
//! When any stage stops (capture failure, end of input, shutdown, or a crash)
//! the shared cancellation token is fired and every task is awaited before
//! [`Session::run`] returns.

use crate::audio_seg::{AudioSegmenter, SegmenterEvent};
use crate::barge_in::BargeInSignal;
use crate::capture::{spawn_capture, CaptureError, FrameReceiver, FrameSource};
use crate::config::AgentConfig;
use crate::events::SpeechSegment;
use crate::orchestrator::TurnOrchestrator;
use crate::playback::PlaybackController;
use crate::services::{AudioOutput, ChatCompletion, SpeechSynthesizer, SpeechToText};
use crate::transcription::TranscriptionClient;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SEGMENT_QUEUE: usize = 16;
const TURN_QUEUE: usize = 4;

/// Error type for a dialogue session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// A running dialogue between the user and the agent
pub struct Session {
    config: AgentConfig,
    stt: Arc<dyn SpeechToText>,
    chat: Arc<dyn ChatCompletion>,
    tts: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn AudioOutput>,
}

impl Session {
    pub fn new(
        config: AgentConfig,
        stt: Arc<dyn SpeechToText>,
        chat: Arc<dyn ChatCompletion>,
        tts: Arc<dyn SpeechSynthesizer>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            config,
            stt,
            chat,
            tts,
            output,
        }
    }

    /// Run until `shutdown` fires or a pipeline stage stops.
    pub async fn run<S: FrameSource>(self, source: S, shutdown: CancellationToken) -> Result<()> {
        let Session {
            config,
            stt,
            chat,
            tts,
            output,
        } = self;

        info!(
            "Starting session: {} talking to {}",
            config.persona.user_name, config.persona.agent_name
        );

        let barge_in = BargeInSignal::new();
        let (frames, capture_thread) =
            spawn_capture(source, config.frame_queue, shutdown.clone())?;
        let (segment_tx, segment_rx) = mpsc::channel(SEGMENT_QUEUE);
        let (turn_tx, turn_rx) = mpsc::channel(TURN_QUEUE);

        let transcriber = TranscriptionClient::new(stt, config.chat.language.clone());
        let orchestrator =
            TurnOrchestrator::with_chat(transcriber, chat, &config.chat, config.persona.clone());
        let player = PlaybackController::new(tts, output, barge_in.clone(), shutdown.clone());
        let segmenter = AudioSegmenter::new(config.seg.clone(), barge_in);

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        tasks.spawn(segment_loop(segmenter, frames, segment_tx, shutdown.clone()));
        tasks.spawn({
            let shutdown = shutdown.clone();
            async move {
                orchestrator.run(segment_rx, turn_tx, shutdown).await;
                Ok(())
            }
        });
        tasks.spawn(async move {
            player.run(turn_rx).await;
            Ok(())
        });

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            // The first stage to stop takes the whole pipeline down
            shutdown.cancel();
            let result = joined.map_err(SessionError::from).and_then(|r| r);
            if let Err(e) = result {
                error!("Session stage failed: {}", e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        let joined = tokio::task::spawn_blocking(move || capture_thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            warn!("Capture thread did not exit cleanly");
        }

        info!("Session stopped");
        outcome
    }
}

/// Drain captured frames in arrival order and forward finished segments.
async fn segment_loop(
    mut segmenter: AudioSegmenter,
    mut frames: FrameReceiver,
    segments: mpsc::Sender<SpeechSegment>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = frames.recv() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e.into()),
            None => {
                info!("Capture queue closed");
                return Ok(());
            }
        };

        match segmenter.push_frame(&frame.pcm) {
            Some(SegmenterEvent::SpeechEnded(segment)) => {
                debug!(
                    "Queueing segment #{} ({:.2}s)",
                    segment.seq,
                    segment.duration_secs()
                );
                // A stalled orchestrator must not stop frame ingestion
                match segments.try_send(segment) {
                    Ok(()) => {}
                    Err(TrySendError::Full(segment)) => {
                        warn!("Segment queue full, dropping segment #{}", segment.seq);
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("Segment queue closed");
                        return Ok(());
                    }
                }
            }
            Some(SegmenterEvent::SpeechStarted { .. }) | None => {}
        }
    }
}
