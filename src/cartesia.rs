//! Cartesia websocket text-to-speech client
//!
//! Every spoken turn opens its own websocket connection. The socket is split:
//! the write half stays with the [`CartesiaStream`] for the generation request
//! and cancellation, and an inbound task decodes audio chunks into a bounded
//! channel that playback pulls from.

use crate::config::TtsConfig;
use crate::services::{Result, ServiceError, SpeechSynthesizer, TtsStream};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Ws, Message>;
type WsStream = SplitStream<Ws>;

/// Generation request sent once per connection
#[derive(Debug, Serialize)]
pub struct GenerationRequest<'a> {
    pub model_id: &'a str,
    pub transcript: &'a str,
    pub voice: Voice<'a>,
    pub output_format: OutputFormat<'a>,
    pub context_id: &'a str,
    #[serde(rename = "continue")]
    pub continue_: bool,
}

#[derive(Debug, Serialize)]
pub struct Voice<'a> {
    pub mode: &'static str,
    pub id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct OutputFormat<'a> {
    pub container: &'static str,
    pub encoding: &'a str,
    pub sample_rate: u32,
}

/// Request to stop generation for a context
#[derive(Debug, Serialize)]
pub struct CancelRequest<'a> {
    pub context_id: &'a str,
    pub cancel: bool,
}

/// Messages received from the server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Chunk {
        data: String,
    },
    Done,
    Error {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
    },
    #[serde(other)]
    Other,
}

/// Decoded server event
#[derive(Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Audio(Vec<u8>),
    Done,
    Ignored,
}

/// Decode one text frame from the server.
pub fn parse_server_message(text: &str) -> Result<ServerEvent> {
    match serde_json::from_str::<ServerMessage>(text)? {
        ServerMessage::Chunk { data } => general_purpose::STANDARD
            .decode(data.as_bytes())
            .map(ServerEvent::Audio)
            .map_err(|e| ServiceError::Malformed(format!("invalid base64 audio: {}", e))),
        ServerMessage::Done => Ok(ServerEvent::Done),
        ServerMessage::Error { error, status_code } => Err(ServiceError::Api {
            status: status_code.unwrap_or(500),
            message: error.unwrap_or_else(|| "unknown TTS error".to_string()),
        }),
        ServerMessage::Other => Ok(ServerEvent::Ignored),
    }
}

fn next_context_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "turn-{:x}-{}",
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Text-to-speech through the Cartesia websocket API
pub struct CartesiaTts {
    config: TtsConfig,
}

impl CartesiaTts {
    pub fn new(config: TtsConfig) -> Self {
        Self { config }
    }

    fn websocket_url(&self) -> String {
        format!(
            "{}?api_key={}&cartesia_version={}",
            self.config.url, self.config.api_key, self.config.api_version
        )
    }

    fn request_json(&self, text: &str, context_id: &str) -> Result<String> {
        let request = GenerationRequest {
            model_id: &self.config.model_id,
            transcript: text,
            voice: Voice {
                mode: "id",
                id: &self.config.voice_id,
            },
            output_format: OutputFormat {
                container: "raw",
                encoding: &self.config.encoding,
                sample_rate: self.config.sample_rate,
            },
            context_id,
            continue_: false,
        };
        Ok(serde_json::to_string(&request)?)
    }
}

#[async_trait]
impl SpeechSynthesizer for CartesiaTts {
    async fn open(&self, text: &str) -> Result<Box<dyn TtsStream>> {
        info!("Connecting to Cartesia at {}", self.config.url);
        let (ws, _response) = connect_async(self.websocket_url()).await?;
        let (mut sink, stream) = ws.split();

        let context_id = next_context_id();
        sink.send(Message::text(self.request_json(text, &context_id)?))
            .await?;
        debug!("Sent generation request for context {}", context_id);

        let (tx, rx) = mpsc::channel(self.config.chunk_queue.max(1));
        let rx_task = tokio::spawn(read_loop(stream, tx));

        Ok(Box::new(CartesiaStream {
            sink: Some(sink),
            chunks: rx,
            rx_task,
            context_id,
            finished: false,
        }))
    }
}

/// Forward decoded audio to the channel until done, error, or close.
async fn read_loop(mut stream: WsStream, tx: mpsc::Sender<Result<Option<Vec<u8>>>>) {
    debug!("Inbound TTS task started");

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.as_str().to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Ignoring binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!("TTS websocket closed: {:?}", frame);
                let _ = tx.send(Err(ServiceError::ConnectionClosed)).await;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("TTS websocket error: {:?}", e);
                let _ = tx.send(Err(e.into())).await;
                break;
            }
        };

        match parse_server_message(&text) {
            Ok(ServerEvent::Audio(pcm)) => {
                if tx.send(Ok(Some(pcm))).await.is_err() {
                    break;
                }
            }
            Ok(ServerEvent::Done) => {
                let _ = tx.send(Ok(None)).await;
                break;
            }
            Ok(ServerEvent::Ignored) => {}
            Err(e) => {
                error!("TTS server error: {}", e);
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }

    debug!("Inbound TTS task terminated");
}

/// One Cartesia generation, pulled chunk by chunk
pub struct CartesiaStream {
    sink: Option<WsSink>,
    chunks: mpsc::Receiver<Result<Option<Vec<u8>>>>,
    rx_task: JoinHandle<()>,
    context_id: String,
    finished: bool,
}

#[async_trait]
impl TtsStream for CartesiaStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        match self.chunks.recv().await {
            Some(Ok(Some(pcm))) => Ok(Some(pcm)),
            Some(Ok(None)) => {
                self.finished = true;
                Ok(None)
            }
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Err(ServiceError::ConnectionClosed)
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.finished = true;
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let request = CancelRequest {
            context_id: &self.context_id,
            cancel: true,
        };
        sink.send(Message::text(serde_json::to_string(&request)?))
            .await?;
        debug!("Cancelled TTS context {}", self.context_id);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.send(Message::Close(None)).await {
                warn!("Failed to send close frame: {}", e);
            }
            let _ = sink.close().await;
            debug!("TTS connection for context {} closed", self.context_id);
        }
        self.rx_task.abort();
    }
}

impl Drop for CartesiaStream {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}
