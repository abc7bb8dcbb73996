//! Anthropic re-framer: upstream Responses events to Anthropic Messages events.

use hyper::body::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use super::sse::{SseEvent, event_frame};
use super::{Reframer, StreamState};
use crate::format::anthropic::{
    ContentBlock, ContentDelta, ErrorData, MessageDeltaData, MessageDeltaUsage, MessageStart,
    MessagesResponse, Role, StopReason, StreamEvent, Usage,
};
use crate::format::{Loose, extract_text, new_id, stop_reason_from_responses, usage_from_responses};

/// Upstream Responses stream events, as far as this re-framer cares.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedUpstream {
    Ping,
    TextDelta(String),
    /// `response.completed` or `response.incomplete`, with the embedded response.
    Completed(Value),
    Error(String),
    Done,
    Other,
    Malformed(String),
}

/// Classify by the `type` field, falling back to the SSE `event:` name.
pub fn classify(event: &SseEvent) -> TypedUpstream {
    let data = event.data.trim();
    if data == "[DONE]" {
        return TypedUpstream::Done;
    }
    let payload: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => return TypedUpstream::Malformed(e.to_string()),
    };
    let kind = payload
        .text_field("type")
        .map(str::to_string)
        .or_else(|| event.event.clone());
    let Some(kind) = kind else {
        return TypedUpstream::Malformed("event has no type".to_string());
    };

    match kind.as_str() {
        "ping" => TypedUpstream::Ping,
        "response.output_text.delta" => payload
            .str_field("delta")
            .map(|d| TypedUpstream::TextDelta(d.to_string()))
            .unwrap_or(TypedUpstream::Other),
        "response.completed" | "response.incomplete" => TypedUpstream::Completed(
            payload.field("response").cloned().unwrap_or(Value::Null),
        ),
        "error" | "response.failed" => TypedUpstream::Error(error_message(&payload)),
        _ => TypedUpstream::Other,
    }
}

fn error_message(payload: &Value) -> String {
    payload
        .text_field("message")
        .or_else(|| payload.path(&["error", "message"]).and_then(Value::as_str))
        .or_else(|| {
            payload
                .path(&["response", "error", "message"])
                .and_then(Value::as_str)
        })
        .unwrap_or("upstream stream error")
        .to_string()
}

pub struct AnthropicReframer {
    state: StreamState,
    message_id: String,
    model: String,
    message_started: bool,
    block_started: bool,
    saw_delta: bool,
}

impl AnthropicReframer {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::NotStarted,
            message_id: new_id("msg_"),
            model: model.to_string(),
            message_started: false,
            block_started: false,
            saw_delta: false,
        }
    }

    /// The whole event sequence for a message fetched without streaming.
    pub fn replay(message: &MessagesResponse) -> Vec<Bytes> {
        let mut reframer = Self::new(&message.model);
        reframer.message_id = message.id.clone();
        let mut frames = reframer.delta(&message.text());
        frames.extend(reframer.finish(
            message.stop_reason.unwrap_or(StopReason::EndTurn),
            message.usage,
        ));
        frames
    }

    fn emit(event: &StreamEvent) -> Bytes {
        event_frame(event.event_name(), event)
    }

    fn start_message(&mut self) -> Vec<Bytes> {
        if self.message_started {
            return Vec::new();
        }
        self.message_started = true;
        self.state = StreamState::Streaming;
        vec![Self::emit(&StreamEvent::MessageStart {
            message: MessageStart {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        })]
    }

    fn start_block(&mut self) -> Vec<Bytes> {
        let mut frames = self.start_message();
        if !self.block_started {
            self.block_started = true;
            frames.push(Self::emit(&StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::Text {
                    text: String::new(),
                },
            }));
        }
        frames
    }

    fn delta(&mut self, text: &str) -> Vec<Bytes> {
        if text.is_empty() {
            return Vec::new();
        }
        self.saw_delta = true;
        let mut frames = self.start_block();
        frames.push(Self::emit(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::Text {
                text: text.to_string(),
            },
        }));
        frames
    }

    fn finish(&mut self, stop_reason: StopReason, usage: Usage) -> Vec<Bytes> {
        let mut frames = self.start_block();
        self.state = StreamState::Completed;
        frames.push(Self::emit(&StreamEvent::ContentBlockStop { index: 0 }));
        frames.push(Self::emit(&StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: MessageDeltaUsage {
                output_tokens: usage.output_tokens,
            },
        }));
        frames.push(Self::emit(&StreamEvent::MessageStop));
        frames
    }

    fn complete(&mut self, response: &Value) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if !self.saw_delta {
            frames.extend(self.delta(&extract_text(response)));
        }
        frames.extend(self.finish(
            stop_reason_from_responses(response),
            usage_from_responses(response),
        ));
        frames
    }

    fn fail(&mut self, message: String) -> Vec<Bytes> {
        warn!(message = %message, "Upstream reported an error mid-stream");
        self.state = StreamState::Failed;
        vec![Self::emit(&StreamEvent::Error {
            error: ErrorData {
                error_type: "api_error".to_string(),
                message,
            },
        })]
    }
}

impl Reframer for AnthropicReframer {
    fn on_event(&mut self, event: SseEvent) -> Vec<Bytes> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match classify(&event) {
            TypedUpstream::Ping => {
                let mut frames = self.start_message();
                frames.push(Self::emit(&StreamEvent::Ping));
                frames
            }
            TypedUpstream::TextDelta(text) => self.delta(&text),
            TypedUpstream::Completed(response) => self.complete(&response),
            TypedUpstream::Error(message) => self.fail(message),
            TypedUpstream::Done => self.finish(StopReason::EndTurn, Usage::default()),
            TypedUpstream::Other => Vec::new(),
            TypedUpstream::Malformed(reason) => {
                debug!(reason = %reason, "Skipping malformed Responses frame");
                Vec::new()
            }
        }
    }

    fn on_eof(&mut self) -> Vec<Bytes> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.finish(StopReason::EndTurn, Usage::default())
    }

    fn on_transport_error(&mut self, _error: &str) -> Vec<Bytes> {
        self.state = StreamState::Failed;
        Vec::new()
    }

    fn state(&self) -> StreamState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::message_from_responses;
    use crate::stream::test_support::{parse, run};
    use serde_json::json;

    fn typed(kind: &str, payload: Value) -> String {
        let mut payload = payload;
        payload["type"] = json!(kind);
        format!("event: {}\ndata: {}\n\n", kind, payload)
    }

    fn delta(text: &str) -> String {
        typed("response.output_text.delta", json!({"delta": text}))
    }

    fn completed(text: &str, status: &str) -> String {
        typed(
            "response.completed",
            json!({"response": {
                "status": status,
                "incomplete_details": {"reason": "max_output_tokens"},
                "output": [{"type": "message", "content": [{"type": "output_text", "text": text}]}],
                "usage": {"input_tokens": 9, "output_tokens": 3}
            }}),
        )
    }

    fn events(out: &str) -> Vec<(String, Value)> {
        parse(out)
            .into_iter()
            .map(|(name, data)| (name.unwrap(), serde_json::from_str(&data).unwrap()))
            .collect()
    }

    fn names(events: &[(String, Value)]) -> Vec<&str> {
        events.iter().map(|(n, _)| n.as_str()).collect()
    }

    const FULL: [&str; 7] = [
        "message_start",
        "content_block_start",
        "content_block_delta",
        "content_block_delta",
        "content_block_stop",
        "message_delta",
        "message_stop",
    ];

    #[tokio::test]
    async fn test_event_order_and_usage() {
        let raw = format!(
            "{}{}{}{}",
            typed("response.created", json!({"response": {}})),
            delta("Hi"),
            delta(" there"),
            completed("Hi there", "completed")
        );
        let out = run(&[raw.as_bytes()], AnthropicReframer::new("claude-x")).await;
        let events = events(&out);
        assert_eq!(names(&events), FULL);

        for (name, payload) in &events {
            assert_eq!(payload["type"], name.as_str());
        }
        assert_eq!(events[0].1["message"]["model"], "claude-x");
        assert_eq!(events[0].1["message"]["role"], "assistant");
        assert_eq!(events[1].1["content_block"], json!({"type": "text", "text": ""}));
        assert_eq!(events[2].1["delta"], json!({"type": "text_delta", "text": "Hi"}));
        assert_eq!(events[5].1["delta"]["stop_reason"], "end_turn");
        assert_eq!(events[5].1["usage"]["output_tokens"], 3);
    }

    #[tokio::test]
    async fn test_deltas_keep_order_across_reads() {
        let pieces = ["a", "bc", "dé", "f"];
        let mut raw: String = pieces.iter().map(|p| delta(p)).collect();
        raw.push_str("data: [DONE]\n\n");
        let reads: Vec<&[u8]> = raw.as_bytes().chunks(3).collect();

        let out = run(&reads, AnthropicReframer::new("m")).await;
        let text: String = events(&out)
            .iter()
            .filter(|(n, _)| n == "content_block_delta")
            .map(|(_, p)| p["delta"]["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(text, "abcdéf");
    }

    #[tokio::test]
    async fn test_completed_without_deltas_extracts_text() {
        let out = run(
            &[completed("whole answer", "incomplete").as_bytes()],
            AnthropicReframer::new("m"),
        )
        .await;
        let events = events(&out);
        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(events[2].1["delta"]["text"], "whole answer");
        assert_eq!(events[4].1["delta"]["stop_reason"], "max_tokens");
    }

    #[tokio::test]
    async fn test_exactly_one_message_stop() {
        let done_only = format!("{}data: [DONE]\n\n", delta("x"));
        let eof_only = delta("x");
        let completed_then_done = format!("{}{}data: [DONE]\n\n", delta("x"), completed("x", "completed"));

        for raw in [done_only, eof_only, completed_then_done] {
            let out = run(&[raw.as_bytes()], AnthropicReframer::new("m")).await;
            assert_eq!(out.matches("event: message_stop").count(), 1, "{}", out);
            assert_eq!(out.matches("event: message_start").count(), 1);
        }
    }

    #[tokio::test]
    async fn test_empty_stream_still_terminates() {
        let out = run(&[], AnthropicReframer::new("m")).await;
        assert_eq!(
            names(&events(&out)),
            vec![
                "message_start",
                "content_block_start",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }

    #[tokio::test]
    async fn test_error_ends_without_message_stop() {
        let raw = format!(
            "{}{}{}",
            delta("a"),
            typed("error", json!({"message": "overloaded"})),
            delta("late")
        );
        let out = run(&[raw.as_bytes()], AnthropicReframer::new("m")).await;
        let events = events(&out);
        let (name, payload) = events.last().unwrap();
        assert_eq!(name, "error");
        assert_eq!(payload["error"], json!({"type": "api_error", "message": "overloaded"}));
        assert!(!out.contains("message_stop"));
        assert!(!out.contains("late"));
    }

    #[tokio::test]
    async fn test_error_first_skips_message_start() {
        let raw = typed("response.failed", json!({"response": {"error": {"message": "nope"}}}));
        let out = run(&[raw.as_bytes()], AnthropicReframer::new("m")).await;
        let events = events(&out);
        assert_eq!(names(&events), vec!["error"]);
        assert_eq!(events[0].1["error"]["message"], "nope");
    }

    #[tokio::test]
    async fn test_ping_forwarded_after_lazy_start() {
        let raw = format!("event: ping\ndata: {{}}\n\n{}", delta("x"));
        let out = run(&[raw.as_bytes()], AnthropicReframer::new("m")).await;
        let events = events(&out);
        assert_eq!(&names(&events)[..3], ["message_start", "ping", "content_block_start"]);
    }

    #[test]
    fn test_classify_uses_type_then_event_name() {
        let typed_only = SseEvent {
            event: None,
            data: r#"{"type":"response.output_text.delta","delta":"a"}"#.to_string(),
        };
        assert_eq!(classify(&typed_only), TypedUpstream::TextDelta("a".to_string()));

        let named_only = SseEvent {
            event: Some("response.output_text.delta".to_string()),
            data: r#"{"delta":"b"}"#.to_string(),
        };
        assert_eq!(classify(&named_only), TypedUpstream::TextDelta("b".to_string()));

        let untyped = SseEvent {
            event: None,
            data: "{}".to_string(),
        };
        assert!(matches!(classify(&untyped), TypedUpstream::Malformed(_)));

        let other = SseEvent {
            event: None,
            data: r#"{"type":"response.in_progress"}"#.to_string(),
        };
        assert_eq!(classify(&other), TypedUpstream::Other);
    }

    #[test]
    fn test_replay() {
        let message = message_from_responses(
            &json!({"output_text": "reasoned", "usage": {"input_tokens": 2, "output_tokens": 5}}),
            "o1",
        );
        let out: String = AnthropicReframer::replay(&message)
            .iter()
            .map(|f| String::from_utf8_lossy(f).to_string())
            .collect();
        let events = events(&out);
        assert_eq!(events.len(), 6);
        assert_eq!(events[0].1["message"]["id"], message.id.as_str());
        assert_eq!(events[2].1["delta"]["text"], "reasoned");
        assert_eq!(events[4].1["usage"]["output_tokens"], 5);
        assert_eq!(events[5].0, "message_stop");
    }
}
