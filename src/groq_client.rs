//! HTTP client for the Groq speech-to-text and chat completion endpoints

use crate::config::ChatConfig;
use crate::groq::{
    api_error, parse_chunk, ChatRequest, ChatResponse, SseDecoder, SseEvent,
    TranscriptionResponse,
};
use crate::services::{
    ChatCompletion, CompletionRequest, EncodedAudio, Result, ServiceError, SpeechToText,
};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream};
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Instant;
use tracing::{debug, info};

/// Groq client shared by transcription, classification and reply generation
#[derive(Clone)]
pub struct GroqClient {
    http: Client,
    config: ChatConfig,
}

impl GroqClient {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_chat(&self, request: &CompletionRequest, stream: bool) -> Result<Response> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            stream,
        };

        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(api_error(status.as_u16(), &body))
}

#[async_trait]
impl SpeechToText for GroqClient {
    async fn transcribe(&self, audio: &EncodedAudio) -> Result<String> {
        let started = Instant::now();
        let file = Part::bytes(audio.wav.clone())
            .file_name("segment.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.config.stt_model.clone())
            .text("language", audio.language.clone())
            .text("response_format", "json");

        let response = self
            .http
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: TranscriptionResponse = response.json().await?;
        info!(
            "Transcribed {} bytes in {}ms",
            audio.wav.len(),
            started.elapsed().as_millis()
        );
        Ok(body.text)
    }
}

#[async_trait]
impl ChatCompletion for GroqClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let started = Instant::now();
        let response = self.post_chat(&request, false).await?;
        let body: ChatResponse = response.json().await?;
        let text = body.into_text()?;
        debug!(
            "Completion ({} tokens max) in {}ms: {:?}",
            request.max_tokens,
            started.elapsed().as_millis(),
            text
        );
        Ok(text)
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let response = self.post_chat(&request, true).await?;
        Ok(delta_stream(response.bytes_stream()).boxed())
    }
}

struct DeltaState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn a raw SSE body into a stream of text deltas, ending at `[DONE]`.
fn delta_stream<S, B, E>(body: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ServiceError> + Send,
{
    let state = DeltaState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(delta), state));
            }
            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for event in state.decoder.push(bytes.as_ref()) {
                        match event {
                            SseEvent::Data(json) => match parse_chunk(&json) {
                                Ok(Some(delta)) => state.pending.push_back(delta),
                                Ok(None) => {}
                                Err(e) => {
                                    state.done = true;
                                    return Some((Err(e), state));
                                }
                            },
                            SseEvent::Done => {
                                state.done = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    debug!("Completion stream ended without [DONE]");
                    state.done = true;
                }
            }
        }
    })
}
