//! Turn-taking orchestration
//!
//! Every transcribed segment extends the running utterance. The updated text
//! is then sent to the completeness classifier and to the reply generator at
//! the same time, so that a reply is already waiting when the turn turns out
//! to be finished. Replies for unfinished turns are thrown away.

use crate::config::{ChatConfig, Persona};
use crate::events::{ChatMessage, SpeechSegment, Turn};
use crate::services::{ChatCompletion, CompletionRequest, Result, ServiceError};
use crate::transcription::TranscriptionClient;
use crate::utterance::UtteranceAssembler;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLASSIFIER_PROMPT: &str = "You judge whether a speaker has finished their thought. \
You are given a live transcription of what they have said so far. \
Answer YES if it reads as a finished thought that expects a reply. \
Answer NO if they are most likely still in the middle of speaking. \
Reply with the single word YES or NO.";

/// Classifier verdict on the accumulated utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Incomplete,
    /// Neither a clear yes nor a clear no, or the check failed
    Ambiguous,
}

impl Completeness {
    /// Interpret a classifier answer.
    pub fn parse(answer: &str) -> Self {
        let answer = answer.trim().to_uppercase();
        if answer.starts_with("YES") {
            Completeness::Complete
        } else if answer.starts_with("NO") {
            Completeness::Incomplete
        } else {
            Completeness::Ambiguous
        }
    }

    /// Whether the turn ends here. Ambiguous verdicts are treated as complete.
    pub fn finishes_turn(self) -> bool {
        match self {
            Completeness::Complete | Completeness::Ambiguous => true,
            Completeness::Incomplete => false,
        }
    }
}

/// Short bounded query deciding whether an utterance is a finished turn
#[derive(Clone)]
pub struct TurnCompletionClassifier {
    chat: Arc<dyn ChatCompletion>,
    max_tokens: u32,
}

impl TurnCompletionClassifier {
    pub fn new(chat: Arc<dyn ChatCompletion>, max_tokens: u32) -> Self {
        Self { chat, max_tokens }
    }

    /// Classify `text`. A failed request counts as [`Completeness::Ambiguous`].
    pub async fn classify(&self, text: &str) -> Completeness {
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(CLASSIFIER_PROMPT),
                ChatMessage::user(format!("Live transcription: {}", text)),
            ],
            max_tokens: self.max_tokens,
        };

        match self.chat.complete(request).await {
            Ok(answer) => {
                let verdict = Completeness::parse(&answer);
                debug!("Completeness answer {:?} -> {:?}", answer, verdict);
                verdict
            }
            Err(e) => {
                warn!("Completeness check failed: {}", e);
                Completeness::Ambiguous
            }
        }
    }
}

/// Produces the conversational reply for the current utterance
#[derive(Clone)]
pub struct ResponseGenerator {
    chat: Arc<dyn ChatCompletion>,
    persona: Persona,
    max_tokens: u32,
}

impl ResponseGenerator {
    pub fn new(chat: Arc<dyn ChatCompletion>, persona: Persona, max_tokens: u32) -> Self {
        Self {
            chat,
            persona,
            max_tokens,
        }
    }

    fn system_prompt(&self) -> String {
        let agent = &self.persona.agent_name;
        let user = &self.persona.user_name;
        format!(
            "You are a human-like person. Your name is {agent}. \
             Keep responses to 1 or 2 sentences or phrases at most. \
             Do not start messages with '{agent}'. \
             Do not overuse {user}'s name."
        )
    }

    /// Generate a reply to `utterance` given the dialogue so far.
    pub async fn generate(&self, history: &[ChatMessage], utterance: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt()));
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(self.persona.speaker_line(utterance)));

        let started = Instant::now();
        let mut deltas = self
            .chat
            .complete_stream(CompletionRequest {
                messages,
                max_tokens: self.max_tokens,
            })
            .await?;

        let mut reply = String::new();
        while let Some(delta) = deltas.next().await {
            if reply.is_empty() {
                debug!("First reply token after {}ms", started.elapsed().as_millis());
            }
            reply.push_str(&delta?);
        }

        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(ServiceError::Malformed("empty reply".to_string()));
        }
        debug!("Reply generated in {}ms", started.elapsed().as_millis());
        Ok(reply)
    }
}

/// Decides turn boundaries and produces finished [`Turn`]s
pub struct TurnOrchestrator {
    transcriber: TranscriptionClient,
    classifier: TurnCompletionClassifier,
    generator: ResponseGenerator,
    persona: Persona,
    utterance: UtteranceAssembler,
    history: Vec<ChatMessage>,
    next_turn: u64,
}

impl TurnOrchestrator {
    pub fn new(
        transcriber: TranscriptionClient,
        classifier: TurnCompletionClassifier,
        generator: ResponseGenerator,
        persona: Persona,
    ) -> Self {
        Self {
            transcriber,
            classifier,
            generator,
            persona,
            utterance: UtteranceAssembler::new(),
            history: Vec::new(),
            next_turn: 0,
        }
    }

    /// Build an orchestrator whose classifier and generator share one chat client.
    pub fn with_chat(
        transcriber: TranscriptionClient,
        chat: Arc<dyn ChatCompletion>,
        config: &ChatConfig,
        persona: Persona,
    ) -> Self {
        let classifier = TurnCompletionClassifier::new(chat.clone(), config.classifier_max_tokens);
        let generator = ResponseGenerator::new(chat, persona.clone(), config.reply_max_tokens);
        Self::new(transcriber, classifier, generator, persona)
    }

    /// Transcribe a segment and feed the text into the current utterance.
    pub async fn on_segment(&mut self, segment: &SpeechSegment) -> Option<Turn> {
        let text = self.transcriber.transcribe(segment).await;
        if text.is_empty() {
            debug!("Segment #{} produced no text, dropped", segment.seq);
            return None;
        }
        self.on_transcript(&text).await
    }

    /// Extend the utterance and decide whether the turn is finished.
    pub async fn on_transcript(&mut self, text: &str) -> Option<Turn> {
        let snapshot = self.utterance.append(text).to_string();
        if snapshot.is_empty() {
            return None;
        }
        info!("Utterance so far: {:?}", snapshot);

        let started = Instant::now();
        let (verdict, reply) = tokio::join!(
            self.classifier.classify(&snapshot),
            self.generator.generate(&self.history, &snapshot),
        );
        debug!(
            "Classification and generation joined after {}ms",
            started.elapsed().as_millis()
        );

        if !verdict.finishes_turn() {
            info!("Turn not finished, discarding speculative reply");
            return None;
        }

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Reply generation failed, keeping utterance: {}", e);
                return None;
            }
        };

        let transcript = self.utterance.take();
        self.history.push(ChatMessage::user(self.persona.speaker_line(&transcript)));
        self.history.push(ChatMessage::assistant(reply.clone()));

        let turn = Turn {
            seq: self.next_turn,
            transcript,
            reply,
        };
        self.next_turn += 1;
        info!("Turn #{} complete ({:?})", turn.seq, verdict);
        Some(turn)
    }

    /// Text accumulated for the turn in progress
    pub fn pending_text(&self) -> &str {
        self.utterance.text()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Consume segments in order and forward finished turns to playback.
    pub async fn run(
        mut self,
        mut segments: mpsc::Receiver<SpeechSegment>,
        turns: mpsc::Sender<Turn>,
        shutdown: CancellationToken,
    ) {
        info!("Turn orchestrator started");

        loop {
            let segment = tokio::select! {
                _ = shutdown.cancelled() => break,
                segment = segments.recv() => match segment {
                    Some(segment) => segment,
                    None => break,
                },
            };

            let turn = tokio::select! {
                _ = shutdown.cancelled() => break,
                turn = self.on_segment(&segment) => turn,
            };

            if let Some(turn) = turn {
                if turns.send(turn).await.is_err() {
                    warn!("Turn queue closed");
                    break;
                }
            }
        }

        info!("Turn orchestrator stopped");
    }
}
