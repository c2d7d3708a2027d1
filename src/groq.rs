//! Groq OpenAI-compatible API wire types
//!
//! Request and response bodies for chat completions and audio
//! transcriptions, plus an incremental decoder for the server-sent event
//! stream returned by streaming completions.

use crate::events::ChatMessage;
use crate::services::{Result, ServiceError};
use serde::{Deserialize, Serialize};

/// Body of `POST /chat/completions`
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// One streamed completion chunk
#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Response of `POST /audio/transcriptions` with `response_format=json`
#[derive(Debug, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ChatResponse {
    /// Text of the first choice
    pub fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::Malformed("completion has no content".to_string()))
    }
}

/// Extract the text delta of a streamed chunk, if it carries one.
pub fn parse_chunk(json: &str) -> Result<Option<String>> {
    let chunk: ChatChunk = serde_json::from_str(json)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty()))
}

/// Build an API error from a non-success status and its body.
pub fn api_error(status: u16, body: &str) -> ServiceError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    ServiceError::Api { status, message }
}

/// Events of a completion stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` events. Lines may straddle chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_sse_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        events
    }
}

/// Parse a single SSE line; comments, blank lines and other fields yield nothing.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        None
    } else if data == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_serialization() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("Scott: hi"),
        ];
        let request = ChatRequest {
            model: "llama-3.1-8b-instant",
            messages: &messages,
            max_tokens: 1,
            stream: false,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama-3.1-8b-instant");
        assert_eq!(json["max_tokens"], 1);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "Scott: hi");
        assert!(json.get("stream").is_none());

        let streaming = ChatRequest { stream: true, ..request };
        assert_eq!(serde_json::to_value(&streaming).unwrap()["stream"], true);
    }

    #[test]
    fn test_chat_response_text() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"YES"}}]}"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.into_text().unwrap(), "YES");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(empty.into_text(), Err(ServiceError::Malformed(_))));
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(events.is_empty());

        events.extend(decoder.push(b"lo\"}}]}\r\n\r\n: keep-alive\n"));
        events.extend(decoder.push(b"data: {\"choices\":[{\"delta\":{}}]}\ndata: [DONE]\n"));

        assert_eq!(events.len(), 3);
        match &events[0] {
            SseEvent::Data(json) => assert_eq!(parse_chunk(json).unwrap().as_deref(), Some("Hello")),
            other => panic!("Unexpected event: {:?}", other),
        }
        match &events[1] {
            SseEvent::Data(json) => assert_eq!(parse_chunk(json).unwrap(), None),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert_eq!(events[2], SseEvent::Done);
    }

    #[test]
    fn test_api_error_message() {
        let err = api_error(401, r#"{"error":{"message":"Invalid API Key","type":"invalid_request_error"}}"#);
        match err {
            ServiceError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API Key");
            }
            other => panic!("Unexpected error: {:?}", other),
        }

        let err = api_error(502, "Bad Gateway\n");
        assert!(matches!(err, ServiceError::Api { status: 502, ref message } if message == "Bad Gateway"));
    }
}
