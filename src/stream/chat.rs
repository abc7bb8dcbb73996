//! Chat Completions re-framer: upstream chat chunks to minimal delta chunks.

use hyper::body::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use super::sse::{SseEvent, data_frame, json_frame};
use super::{Reframer, StreamState};
use crate::format::openai::{ChatChunk, ChatCompletion, ChunkChoice, ChunkDelta};
use crate::format::{Loose, new_id, synth_fingerprint, unix_now};

pub const DONE: &str = "[DONE]";

/// Upstream chat stream frames, as far as the re-framers care.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpstream {
    Done,
    Chunk(Value),
    Error(Value),
    Malformed(String),
}

pub fn classify(event: &SseEvent) -> ChatUpstream {
    let data = event.data.trim();
    if data == DONE {
        return ChatUpstream::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) if value.field("error").is_some() => ChatUpstream::Error(value),
        Ok(value) if value.is_object() => ChatUpstream::Chunk(value),
        Ok(_) => ChatUpstream::Malformed("frame is not a JSON object".to_string()),
        Err(e) => ChatUpstream::Malformed(e.to_string()),
    }
}

/// Non-empty `choices[i].delta.content` values with their choice index.
pub fn chunk_deltas(chunk: &Value) -> Vec<(u64, String)> {
    chunk
        .array_field("choices")
        .map(|choices| {
            choices
                .iter()
                .enumerate()
                .filter_map(|(i, choice)| {
                    let content = choice.path(&["delta", "content"])?.as_str()?;
                    if content.is_empty() {
                        return None;
                    }
                    let index = choice.u64_field("index").unwrap_or(i as u64);
                    Some((index, content.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Stream identity used when upstream chunks omit it.
#[derive(Debug, Clone)]
struct Identity {
    id: String,
    created: u64,
    model: String,
    fingerprint: String,
}

pub struct ChatReframer {
    state: StreamState,
    fallback: Identity,
}

impl ChatReframer {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::NotStarted,
            fallback: Identity {
                id: new_id("chatcmpl-"),
                created: unix_now(),
                model: model.to_string(),
                fingerprint: synth_fingerprint(),
            },
        }
    }

    fn on_chunk(&mut self, chunk: &Value) -> Vec<Bytes> {
        let frames: Vec<Bytes> = chunk_deltas(chunk)
            .into_iter()
            .map(|(index, content)| {
                json_frame(&ChatChunk {
                    id: chunk
                        .text_field("id")
                        .unwrap_or(&self.fallback.id)
                        .to_string(),
                    object: "chat.completion.chunk".to_string(),
                    created: chunk
                        .u64_field("created")
                        .filter(|c| *c > 0)
                        .unwrap_or(self.fallback.created),
                    model: chunk
                        .text_field("model")
                        .unwrap_or(&self.fallback.model)
                        .to_string(),
                    system_fingerprint: chunk
                        .text_field("system_fingerprint")
                        .unwrap_or(&self.fallback.fingerprint)
                        .to_string(),
                    choices: vec![ChunkChoice {
                        index,
                        delta: ChunkDelta { content },
                    }],
                })
            })
            .collect();
        if !frames.is_empty() {
            self.state = StreamState::Streaming;
        }
        frames
    }

    fn complete(&mut self) -> Vec<Bytes> {
        self.state = StreamState::Completed;
        vec![data_frame(DONE)]
    }

    /// The whole stream for an answer fetched without streaming.
    pub fn replay(completion: &ChatCompletion) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(2);
        let text = completion.text();
        if !text.is_empty() {
            frames.push(json_frame(&ChatChunk {
                id: completion.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: completion.created,
                model: completion.model.clone(),
                system_fingerprint: completion.system_fingerprint.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        content: text.to_string(),
                    },
                }],
            }));
        }
        frames.push(data_frame(DONE));
        frames
    }
}

impl Reframer for ChatReframer {
    fn on_event(&mut self, event: SseEvent) -> Vec<Bytes> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match classify(&event) {
            ChatUpstream::Done => self.complete(),
            ChatUpstream::Chunk(chunk) => self.on_chunk(&chunk),
            ChatUpstream::Error(body) => {
                warn!(error = %body["error"], "Upstream reported an error mid-stream");
                self.state = StreamState::Failed;
                vec![json_frame(&body)]
            }
            ChatUpstream::Malformed(reason) => {
                debug!(reason = %reason, "Skipping malformed chat frame");
                Vec::new()
            }
        }
    }

    fn on_eof(&mut self) -> Vec<Bytes> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.complete()
    }

    fn on_transport_error(&mut self, _error: &str) -> Vec<Bytes> {
        self.state = StreamState::Failed;
        Vec::new()
    }

    fn state(&self) -> StreamState {
        self.state
    }
}
