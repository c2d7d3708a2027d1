//! PulseAudio capture and playback devices
//!
//! Both directions use PulseAudio's simple API with 16-bit little-endian PCM
//! at 16 kHz mono. Capture is a blocking [`FrameSource`] for the capture
//! thread. Playback owns a writer thread per open sink so that blocking
//! device writes never stall the async side.
//!
//! Playback keeps little audio outside our control: the hand-off queue to
//! the writer thread is bounded, the server buffer is kept short, and writes
//! go out in small pieces. A stop request is therefore noticed within one
//! piece, after which the server buffer is flushed.

use crate::audio_seg::u8_to_i16_slice;
use crate::capture::{CaptureError, FrameSource};
use crate::events::AudioFrame;
use crate::playback::PlaybackError;
use crate::services::{AudioOutput, AudioSink};
use async_trait::async_trait;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::error::PAErr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Chunks queued between the async side and the writer thread
const WRITE_QUEUE: usize = 8;

/// Size of a single blocking device write
const PIECE_MS: u32 = 20;

/// Target length of the server-side playback buffer
const SERVER_BUFFER_MS: u32 = 100;

const DRAIN_POLL: Duration = Duration::from_millis(10);

fn bytes_for_ms(sample_rate: u32, ms: u32) -> u32 {
    sample_rate * 2 * ms / 1000
}

fn spec(sample_rate: u32) -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate: sample_rate,
    }
}

/// Microphone capture through PulseAudio
pub struct PulseSource {
    simple: Simple,
    frame_bytes: usize,
}

impl PulseSource {
    /// Open the default input, or `device` when given.
    pub fn new(
        app_name: &str,
        device: Option<&str>,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Self, CaptureError> {
        let simple = Simple::new(
            None,     // default server
            app_name, // application name
            Direction::Record,
            device,
            "record", // stream description
            &spec(sample_rate),
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| CaptureError::Open(e.to_string()))?;

        info!(
            "Capturing from {} ({} samples per frame)",
            device.unwrap_or("default source"),
            frame_samples
        );
        Ok(Self {
            simple,
            frame_bytes: frame_samples * 2,
        })
    }
}

impl FrameSource for PulseSource {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError> {
        let mut buffer = vec![0u8; self.frame_bytes];
        self.simple
            .read(&mut buffer)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        Ok(Some(AudioFrame::new(u8_to_i16_slice(&buffer))))
    }
}

enum WriterCommand {
    Write(Vec<u8>),
    Drain(oneshot::Sender<Result<(), String>>),
}

/// Speaker output through PulseAudio. Only one sink can be open at a time.
pub struct PulseOutput {
    app_name: String,
    sample_rate: u32,
    in_use: Arc<AtomicBool>,
}

impl PulseOutput {
    pub fn new(app_name: &str, sample_rate: u32) -> Self {
        Self {
            app_name: app_name.to_string(),
            sample_rate,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    fn buffer_attr(&self) -> BufferAttr {
        BufferAttr {
            maxlength: u32::MAX,
            tlength: bytes_for_ms(self.sample_rate, SERVER_BUFFER_MS),
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        }
    }
}

impl AudioOutput for PulseOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>, PlaybackError> {
        if self.in_use.swap(true, Ordering::AcqRel) {
            return Err(PlaybackError::DeviceBusy);
        }

        let simple = match Simple::new(
            None,
            &self.app_name,
            Direction::Playback,
            None,
            "playback",
            &spec(self.sample_rate),
            None,
            Some(&self.buffer_attr()),
        ) {
            Ok(simple) => simple,
            Err(e) => {
                self.in_use.store(false, Ordering::Release);
                return Err(PlaybackError::Device(e.to_string()));
            }
        };

        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let (released_tx, released_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let writer = Writer {
            simple,
            stop: stop.clone(),
            piece_bytes: bytes_for_ms(self.sample_rate, PIECE_MS).max(2) as usize,
            in_use: self.in_use.clone(),
            released: released_tx,
        };

        // The thread is detached; it releases the device itself on exit
        let spawned = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || writer.run(rx));
        if let Err(e) = spawned {
            self.in_use.store(false, Ordering::Release);
            return Err(PlaybackError::Device(e.to_string()));
        }

        debug!("Playback stream opened");
        Ok(Box::new(PulseSink {
            tx: Some(tx),
            stop,
            released: Some(released_rx),
        }))
    }
}

/// State owned by the playback writer thread
struct Writer {
    simple: Simple,
    stop: Arc<AtomicBool>,
    piece_bytes: usize,
    in_use: Arc<AtomicBool>,
    released: oneshot::Sender<()>,
}

impl Writer {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Runs until the sink is stopped or dropped, then frees the device.
    fn run(self, mut rx: mpsc::Receiver<WriterCommand>) {
        while let Some(command) = rx.blocking_recv() {
            if self.stopped() {
                break;
            }
            match command {
                WriterCommand::Write(pcm) => {
                    if let Err(e) = self.write(&pcm) {
                        error!("Playback write failed: {}", e);
                        break;
                    }
                }
                WriterCommand::Drain(done) => {
                    let _ = done.send(self.drain().map_err(|e| e.to_string()));
                }
            }
        }

        // Discard anything the server still has queued
        if let Err(e) = self.simple.flush() {
            debug!("Playback flush failed: {}", e);
        }

        let Writer {
            simple,
            in_use,
            released,
            ..
        } = self;
        drop(simple);
        in_use.store(false, Ordering::Release);
        let _ = released.send(());
        debug!("Playback writer thread exiting");
    }

    fn write(&self, pcm: &[u8]) -> Result<(), PAErr> {
        for piece in pcm.chunks(self.piece_bytes) {
            if self.stopped() {
                break;
            }
            self.simple.write(piece)?;
        }
        Ok(())
    }

    /// Wait for the server to play out what was written, unless stopped.
    fn drain(&self) -> Result<(), PAErr> {
        let latency = self.simple.get_latency()?;
        let until = Instant::now() + Duration::from_micros(latency.0);

        loop {
            if self.stopped() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= until {
                break;
            }
            std::thread::sleep(DRAIN_POLL.min(until - now));
        }

        // At most a few milliseconds are left at this point
        self.simple.drain()
    }
}

fn writer_gone() -> PlaybackError {
    PlaybackError::Device("playback writer has exited".to_string())
}

struct PulseSink {
    tx: Option<mpsc::Sender<WriterCommand>>,
    stop: Arc<AtomicBool>,
    released: Option<oneshot::Receiver<()>>,
}

impl PulseSink {
    async fn send(&self, command: WriterCommand) -> Result<(), PlaybackError> {
        let tx = self.tx.as_ref().ok_or_else(writer_gone)?;
        tx.send(command).await.map_err(|_| writer_gone())
    }

    /// Ask the writer thread to stop without waiting for it.
    fn request_stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.tx.take();
    }

    /// Stop the writer thread and wait until it has released the device.
    async fn release(&mut self) {
        self.request_stop();
        if let Some(released) = self.released.take() {
            if released.await.is_err() {
                warn!("Playback writer exited without releasing the device");
            }
            debug!("Playback stream released");
        }
    }
}

#[async_trait]
impl AudioSink for PulseSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), PlaybackError> {
        self.send(WriterCommand::Write(pcm.to_vec())).await
    }

    async fn finish(&mut self) -> Result<(), PlaybackError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(WriterCommand::Drain(done_tx)).await?;
        let drained = done_rx
            .await
            .map_err(|_| writer_gone())
            .and_then(|result| result.map_err(PlaybackError::Device));
        self.release().await;
        drained
    }

    async fn stop(&mut self) {
        self.release().await;
    }
}

impl Drop for PulseSink {
    fn drop(&mut self) {
        self.request_stop();
    }
}
