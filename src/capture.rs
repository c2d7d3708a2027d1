//! Audio capture hand-off
//!
//! Blocking device reads run on a dedicated OS thread (not a tokio task) and
//! feed a bounded queue that the async side drains. A full queue blocks the
//! capture thread, a read failure is forwarded once and ends the thread.

use crate::events::AudioFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error type for the capture path
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to open capture device: {0}")]
    Open(String),

    #[error("Capture device read failed: {0}")]
    Read(String),

    #[error("Failed to start capture thread: {0}")]
    Thread(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// A blocking source of fixed-size frames
pub trait FrameSource: Send + 'static {
    /// Block until the next frame is available. `Ok(None)` ends the stream.
    fn read_frame(&mut self) -> Result<Option<AudioFrame>>;
}

/// Receiving end of the capture queue
pub type FrameReceiver = mpsc::Receiver<Result<AudioFrame>>;

/// Start the capture thread and return the receiving end of its queue.
///
/// The thread exits when `stop` is cancelled, the receiver is dropped, the
/// source ends, or a read fails.
pub fn spawn_capture<S: FrameSource>(
    mut source: S,
    capacity: usize,
    stop: CancellationToken,
) -> Result<(FrameReceiver, std::thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = std::thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            info!("Audio capture thread started");
            let mut frames = 0u64;

            while !stop.is_cancelled() {
                match source.read_frame() {
                    Ok(Some(frame)) => {
                        frames += 1;
                        if tx.blocking_send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Capture source ended");
                        break;
                    }
                    Err(e) => {
                        error!("Audio capture error: {}", e);
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }

            info!("Audio capture thread exiting after {} frames", frames);
        })?;

    Ok((rx, handle))
}

/// Replays a fixed list of frames, then ends. Used for offline input.
pub struct VecFrameSource {
    frames: std::vec::IntoIter<AudioFrame>,
}

impl VecFrameSource {
    /// Split `pcm` into frames of `frame_samples`; a short tail is kept.
    pub fn from_pcm(pcm: &[i16], frame_samples: usize) -> Self {
        let frames: Vec<AudioFrame> = pcm
            .chunks(frame_samples.max(1))
            .map(|chunk| AudioFrame::new(chunk.to_vec()))
            .collect();
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl FrameSource for VecFrameSource {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
        Ok(self.frames.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource {
        remaining: usize,
    }

    impl FrameSource for FailingSource {
        fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
            if self.remaining == 0 {
                return Err(CaptureError::Read("device unplugged".to_string()));
            }
            self.remaining -= 1;
            Ok(Some(AudioFrame::new(vec![1; 160])))
        }
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let pcm: Vec<i16> = (0..1000).map(|i| i as i16).collect();
        let source = VecFrameSource::from_pcm(&pcm, 300);
        let (mut rx, handle) = spawn_capture(source, 2, CancellationToken::new()).unwrap();

        let mut received = Vec::new();
        while let Some(frame) = rx.recv().await {
            received.extend(frame.unwrap().pcm);
        }
        assert_eq!(received, pcm);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_read_failure_is_forwarded_then_queue_closes() {
        let (mut rx, handle) =
            spawn_capture(FailingSource { remaining: 2 }, 4, CancellationToken::new()).unwrap();

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(matches!(rx.recv().await, Some(Err(CaptureError::Read(_)))));
        assert!(rx.recv().await.is_none());
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_dropping_receiver_stops_thread() {
        let source = FailingSource { remaining: usize::MAX };
        let (rx, handle) = spawn_capture(source, 1, CancellationToken::new()).unwrap();
        drop(rx);
        handle.join().unwrap();
    }
}
