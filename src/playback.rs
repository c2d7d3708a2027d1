//! Interruptible playback of finished turns
//!
//! Each [`Turn`] is spoken by racing two activities: streaming the reply
//! through TTS into the output device, and waiting on the [`BargeInSignal`].
//! When the signal wins, the playback activity is told to cancel and is
//! awaited until its teardown (TTS cancel and close, device stop) is done.
//! The next turn is only started after that.

use crate::barge_in::BargeInSignal;
use crate::events::Turn;
use crate::services::{AudioOutput, AudioSink, ServiceError, SpeechSynthesizer, TtsStream};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for playback
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Output device is busy")]
    DeviceBusy,

    #[error("Output device error: {0}")]
    Device(String),

    #[error("TTS error: {0}")]
    Tts(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

/// How the playback of one turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The whole reply was played
    Completed,
    /// New user speech interrupted playback
    Interrupted,
    /// The session is shutting down
    Cancelled,
}

enum Interrupt {
    BargeIn,
    Shutdown,
}

/// Speaks turns one at a time, stopping as soon as the user barges in
pub struct PlaybackController {
    tts: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn AudioOutput>,
    barge_in: BargeInSignal,
    shutdown: CancellationToken,
}

impl PlaybackController {
    pub fn new(
        tts: Arc<dyn SpeechSynthesizer>,
        output: Arc<dyn AudioOutput>,
        barge_in: BargeInSignal,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tts,
            output,
            barge_in,
            shutdown,
        }
    }

    /// Play turns from the queue in order until it closes or shutdown.
    pub async fn run(&self, mut turns: mpsc::Receiver<Turn>) {
        info!("Playback controller started");

        loop {
            let turn = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                turn = turns.recv() => match turn {
                    Some(turn) => turn,
                    None => break,
                },
            };

            match self.play_turn(&turn).await {
                Ok(PlaybackOutcome::Cancelled) => break,
                Ok(outcome) => debug!("Turn #{} playback: {:?}", turn.seq, outcome),
                Err(e) => warn!("Playback of turn #{} failed: {}", turn.seq, e),
            }
        }

        info!("Playback controller stopped");
    }

    /// Speak one turn, racing playback against barge-in and shutdown.
    ///
    /// Returns only after the TTS stream and the output device have been
    /// released, whatever the outcome.
    pub async fn play_turn(&self, turn: &Turn) -> Result<PlaybackOutcome> {
        info!("Speaking turn #{}: {:?}", turn.seq, turn.reply);

        let cancel = CancellationToken::new();
        let playback = self.speak(&turn.reply, &cancel);
        tokio::pin!(playback);

        let interrupt = async {
            tokio::select! {
                _ = self.barge_in.wait() => Interrupt::BargeIn,
                _ = self.shutdown.cancelled() => Interrupt::Shutdown,
            }
        };

        tokio::select! {
            result = &mut playback => {
                result?;
                info!("Turn #{} played to the end", turn.seq);
                Ok(PlaybackOutcome::Completed)
            }
            reason = interrupt => {
                cancel.cancel();
                if let Err(e) = playback.await {
                    debug!("Playback error after interruption ignored: {}", e);
                }
                match reason {
                    Interrupt::BargeIn => {
                        info!("User barged in, playback of turn #{} stopped", turn.seq);
                        Ok(PlaybackOutcome::Interrupted)
                    }
                    Interrupt::Shutdown => Ok(PlaybackOutcome::Cancelled),
                }
            }
        }
    }

    /// Stream `text` through TTS into the output device until done or cancelled.
    async fn speak(&self, text: &str, cancel: &CancellationToken) -> Result<()> {
        let mut tts = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            tts = self.tts.open(text) => tts?,
        };

        let result = self.pump(tts.as_mut(), cancel).await;
        tts.close().await;
        result
    }

    async fn pump(&self, tts: &mut dyn TtsStream, cancel: &CancellationToken) -> Result<()> {
        // The device is opened on the first audio buffer
        let mut sink: Option<Box<dyn AudioSink>> = None;
        let mut chunks = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = tts.next_chunk() => Some(chunk?),
            };

            let chunk = match next {
                None => return stop(tts, sink, chunks).await,
                Some(None) => break,
                Some(Some(chunk)) => chunk,
            };

            let device = match sink.take() {
                Some(device) => device,
                None => {
                    debug!("Opening output device");
                    self.output.open()?
                }
            };
            let device = sink.insert(device);

            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                result = device.write(&chunk) => {
                    result?;
                    true
                }
            };
            if !written {
                return stop(tts, sink, chunks).await;
            }
            chunks += 1;
        }

        debug!("TTS finished after {} chunks", chunks);
        if let Some(mut device) = sink {
            let drained = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = device.finish() => Some(result),
            };
            match drained {
                Some(result) => result?,
                None => device.stop().await,
            }
        }
        Ok(())
    }
}

async fn stop(
    tts: &mut dyn TtsStream,
    sink: Option<Box<dyn AudioSink>>,
    chunks: usize,
) -> Result<()> {
    if let Some(mut device) = sink {
        device.stop().await;
    }
    if let Err(e) = tts.cancel().await {
        error!("Failed to cancel TTS generation: {}", e);
    }
    debug!("Playback cancelled after {} chunks", chunks);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{OutputEvent, RecordingOutput, ScriptedTts};
    use std::time::Duration;
    use tokio::time::Instant;

    fn turn(seq: u64, reply: &str) -> Turn {
        Turn {
            seq,
            transcript: "Hello there".to_string(),
            reply: reply.to_string(),
        }
    }

    fn controller(
        tts: &Arc<ScriptedTts>,
        output: &Arc<RecordingOutput>,
        barge_in: &BargeInSignal,
    ) -> PlaybackController {
        PlaybackController::new(
            tts.clone(),
            output.clone(),
            barge_in.clone(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_whole_reply() {
        let tts = Arc::new(ScriptedTts::new(10, Duration::from_millis(100)));
        let output = Arc::new(RecordingOutput::new());
        let barge_in = BargeInSignal::new();

        let outcome = controller(&tts, &output, &barge_in)
            .play_turn(&turn(0, "Hi!"))
            .await
            .unwrap();

        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(output.chunks_written(), 10);
        assert_eq!(output.events().last(), Some(&OutputEvent::Finished));
        assert!(!output.is_open());
        assert_eq!(tts.texts(), vec!["Hi!".to_string()]);
        assert_eq!(tts.closed(), 1);
        assert_eq!(tts.cancelled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_stops_playback_within_one_step() {
        // 5 seconds of reply, user starts talking at 2 seconds
        let tts = Arc::new(ScriptedTts::new(50, Duration::from_millis(100)));
        let output = Arc::new(RecordingOutput::new());
        let barge_in = BargeInSignal::new();
        let started = Instant::now();

        let trigger = tokio::spawn({
            let barge_in = barge_in.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                barge_in.trigger();
            }
        });

        let outcome = controller(&tts, &output, &barge_in)
            .play_turn(&turn(1, "A long answer"))
            .await
            .unwrap();
        let returned_at = started.elapsed();
        trigger.await.unwrap();

        assert_eq!(outcome, PlaybackOutcome::Interrupted);
        assert!(returned_at <= Duration::from_millis(2100), "returned at {:?}", returned_at);
        assert!(!output.is_open(), "device must be closed before returning");
        assert_eq!(output.events().last(), Some(&OutputEvent::Stopped));
        assert!(output
            .write_times()
            .iter()
            .all(|t| t.duration_since(started) <= Duration::from_millis(2100)));
        assert!(output.chunks_written() < 50);
        assert_eq!(tts.cancelled(), 1);
        assert_eq!(tts.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_during_drain_stops_device() {
        // TTS delivers faster than real time, so most of the reply plays out in finish
        let tts = Arc::new(ScriptedTts::new(5, Duration::from_millis(10)));
        let output = Arc::new(RecordingOutput::new().with_drain_time(Duration::from_secs(3)));
        let barge_in = BargeInSignal::new();
        let started = Instant::now();

        let trigger = tokio::spawn({
            let barge_in = barge_in.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                barge_in.trigger();
            }
        });

        let outcome = controller(&tts, &output, &barge_in)
            .play_turn(&turn(4, "A short answer"))
            .await
            .unwrap();
        let returned_at = started.elapsed();
        trigger.await.unwrap();

        assert_eq!(outcome, PlaybackOutcome::Interrupted);
        assert_eq!(output.chunks_written(), 5);
        assert!(returned_at <= Duration::from_millis(1100), "returned at {:?}", returned_at);
        assert!(!output.is_open());
        assert_eq!(output.events(), vec![OutputEvent::Opened, OutputEvent::Stopped]);
        assert_eq!(tts.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_closed_before_next_turn() {
        let tts = Arc::new(ScriptedTts::new(20, Duration::from_millis(100)));
        let output = Arc::new(RecordingOutput::new());
        let barge_in = BargeInSignal::new();
        let player = controller(&tts, &output, &barge_in);

        let (turn_tx, turn_rx) = mpsc::channel(4);
        turn_tx.send(turn(0, "first")).await.unwrap();

        // Interrupt the first turn, then queue the next once the episode ended
        let interrupter = tokio::spawn({
            let barge_in = barge_in.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(550)).await;
                barge_in.trigger();
                tokio::time::sleep(Duration::from_millis(10)).await;
                barge_in.clear();
                turn_tx.send(turn(1, "second")).await.unwrap();
            }
        });

        player.run(turn_rx).await;
        interrupter.await.unwrap();

        let events = output.events();
        let opened = events.iter().filter(|e| **e == OutputEvent::Opened).count();
        assert_eq!(opened, 2);
        assert_eq!(output.busy_rejections(), 0, "second turn must not find the device open");
        // first turn stopped, second finished, never interleaved
        let closes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, OutputEvent::Stopped | OutputEvent::Finished))
            .collect();
        assert_eq!(closes, vec![&OutputEvent::Stopped, &OutputEvent::Finished]);
        assert_eq!(tts.texts(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_triggered_signal_interrupts_immediately() {
        let tts = Arc::new(ScriptedTts::new(10, Duration::from_millis(100)));
        let output = Arc::new(RecordingOutput::new());
        let barge_in = BargeInSignal::new();
        barge_in.trigger();

        let outcome = controller(&tts, &output, &barge_in)
            .play_turn(&turn(2, "stale"))
            .await
            .unwrap();

        assert_eq!(outcome, PlaybackOutcome::Interrupted);
        assert_eq!(output.chunks_written(), 0);
        assert!(!output.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tts_failure_releases_device() {
        let tts = Arc::new(ScriptedTts::new(10, Duration::from_millis(100)).failing_after(3));
        let output = Arc::new(RecordingOutput::new());
        let barge_in = BargeInSignal::new();

        let result = controller(&tts, &output, &barge_in)
            .play_turn(&turn(3, "broken"))
            .await;

        assert!(matches!(result, Err(PlaybackError::Tts(_))));
        assert_eq!(output.chunks_written(), 3);
        assert!(!output.is_open());
        assert_eq!(tts.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_playback() {
        let tts = Arc::new(ScriptedTts::new(50, Duration::from_millis(100)));
        let output = Arc::new(RecordingOutput::new());
        let shutdown = CancellationToken::new();
        let player = PlaybackController::new(
            tts.clone(),
            output.clone(),
            BargeInSignal::new(),
            shutdown.clone(),
        );

        let (turn_tx, turn_rx) = mpsc::channel(1);
        turn_tx.send(turn(0, "long")).await.unwrap();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.cancel();
        });

        player.run(turn_rx).await;
        stopper.await.unwrap();

        assert!(!output.is_open());
        assert_eq!(tts.closed(), 1);
        assert!(output.chunks_written() < 50);
    }
}
