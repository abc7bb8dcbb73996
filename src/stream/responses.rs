//! Responses re-framer: upstream chat chunks to the typed Responses event grammar.

use hyper::body::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use super::chat::{ChatUpstream, chunk_deltas, classify};
use super::sse::{SseEvent, event_frame};
use super::{Reframer, StreamState};
use crate::format::responses::{
    OutputItem, OutputText, ResponseObject, ResponseStreamEvent, ResponseUsage,
};
use crate::format::{Loose, new_id, unix_now, usage_from_chat};

pub struct ResponsesReframer {
    state: StreamState,
    response_id: String,
    item_id: String,
    model: String,
    created_at: u64,
    sequence: u64,
    text: String,
    usage: Option<ResponseUsage>,
}

impl ResponsesReframer {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::NotStarted,
            response_id: new_id("resp_"),
            item_id: new_id("msg_"),
            model: model.to_string(),
            created_at: unix_now(),
            sequence: 0,
            text: String::new(),
            usage: None,
        }
    }

    /// The full event grammar with one delta, for answers fetched without streaming.
    pub fn replay(model: &str, text: &str, usage: Option<ResponseUsage>) -> Vec<Bytes> {
        let mut reframer = Self::new(model);
        reframer.usage = usage;
        let mut frames = reframer.open();
        frames.extend(reframer.delta(text));
        frames.extend(reframer.close());
        frames
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn emit(&self, event: &ResponseStreamEvent) -> Bytes {
        event_frame(event.event_name(), event)
    }

    fn response(&self, status: &str, output: Vec<OutputItem>) -> ResponseObject {
        ResponseObject::new(
            &self.response_id,
            &self.model,
            self.created_at,
            status,
            output,
            None,
        )
    }

    fn open(&mut self) -> Vec<Bytes> {
        if self.state != StreamState::NotStarted {
            return Vec::new();
        }
        self.state = StreamState::Streaming;

        let events = [
            ResponseStreamEvent::Created {
                sequence_number: self.next_sequence(),
                response: self.response("in_progress", Vec::new()),
            },
            ResponseStreamEvent::OutputItemAdded {
                sequence_number: self.next_sequence(),
                output_index: 0,
                item: OutputItem::message(&self.item_id, "in_progress", Vec::new()),
            },
            ResponseStreamEvent::ContentPartAdded {
                sequence_number: self.next_sequence(),
                item_id: self.item_id.clone(),
                output_index: 0,
                content_index: 0,
                part: OutputText::new(""),
            },
        ];
        events.iter().map(|e| self.emit(e)).collect()
    }

    fn delta(&mut self, delta: &str) -> Vec<Bytes> {
        if delta.is_empty() {
            return Vec::new();
        }
        self.text.push_str(delta);
        let event = ResponseStreamEvent::OutputTextDelta {
            sequence_number: self.next_sequence(),
            item_id: self.item_id.clone(),
            output_index: 0,
            content_index: 0,
            delta: delta.to_string(),
        };
        vec![self.emit(&event)]
    }

    fn close(&mut self) -> Vec<Bytes> {
        let mut frames = self.open();
        self.state = StreamState::Completed;

        let part = OutputText::new(self.text.clone());
        let item = OutputItem::message(&self.item_id, "completed", vec![part.clone()]);
        let mut response = self.response("completed", vec![item.clone()]);
        response.usage = self.usage;

        let events = [
            ResponseStreamEvent::OutputTextDone {
                sequence_number: self.next_sequence(),
                item_id: self.item_id.clone(),
                output_index: 0,
                content_index: 0,
                text: self.text.clone(),
            },
            ResponseStreamEvent::ContentPartDone {
                sequence_number: self.next_sequence(),
                item_id: self.item_id.clone(),
                output_index: 0,
                content_index: 0,
                part,
            },
            ResponseStreamEvent::OutputItemDone {
                sequence_number: self.next_sequence(),
                output_index: 0,
                item,
            },
            ResponseStreamEvent::Completed {
                sequence_number: self.next_sequence(),
                response,
            },
        ];
        frames.extend(events.iter().map(|e| self.emit(e)));
        frames
    }

    fn fail(&mut self, body: &Value) -> Vec<Bytes> {
        let error = body.field("error");
        let message = error
            .and_then(|e| e.text_field("message").or_else(|| e.as_str()))
            .unwrap_or("upstream stream error")
            .to_string();
        let code = error
            .and_then(|e| e.text_field("code").or_else(|| e.text_field("type")))
            .map(str::to_string);
        warn!(message = %message, "Upstream reported an error mid-stream");

        self.state = StreamState::Failed;
        let event = ResponseStreamEvent::Error {
            sequence_number: self.next_sequence(),
            code,
            message,
            param: None,
        };
        vec![self.emit(&event)]
    }
}

impl Reframer for ResponsesReframer {
    fn on_event(&mut self, event: SseEvent) -> Vec<Bytes> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match classify(&event) {
            ChatUpstream::Done => self.close(),
            ChatUpstream::Chunk(chunk) => {
                if let Some(usage) = usage_from_chat(&chunk) {
                    self.usage = Some(usage);
                }
                let mut frames = self.open();
                for (_, content) in chunk_deltas(&chunk) {
                    frames.extend(self.delta(&content));
                }
                frames
            }
            ChatUpstream::Error(body) => self.fail(&body),
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
        self.close()
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
    use crate::stream::test_support::{parse, run};
    use serde_json::json;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"choices": [{"index": 0, "delta": {"content": content}}]})
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

    const GRAMMAR_HEAD: [&str; 3] = [
        "response.created",
        "response.output_item.added",
        "response.content_part.added",
    ];
    const GRAMMAR_TAIL: [&str; 4] = [
        "response.output_text.done",
        "response.content_part.done",
        "response.output_item.done",
        "response.completed",
    ];

    #[tokio::test]
    async fn test_full_grammar_and_sequence_numbers() {
        let raw = format!("{}{}data: [DONE]\n\n", chunk("Hel"), chunk("lo"));
        let out = run(&[raw.as_bytes()], ResponsesReframer::new("gpt-4o")).await;
        let events = events(&out);

        let mut expected: Vec<&str> = GRAMMAR_HEAD.to_vec();
        expected.extend(["response.output_text.delta"; 2]);
        expected.extend(GRAMMAR_TAIL);
        assert_eq!(names(&events), expected);

        for (i, (name, payload)) in events.iter().enumerate() {
            assert_eq!(payload["type"], name.as_str());
            assert_eq!(payload["sequence_number"], (i + 1) as u64);
        }

        let (_, done) = &events[5];
        assert_eq!(done["text"], "Hello");
        let (_, completed) = events.last().unwrap();
        assert_eq!(completed["response"]["status"], "completed");
        assert_eq!(
            completed["response"]["output"][0]["content"][0]["text"],
            "Hello"
        );
        assert_eq!(completed["response"]["id"], events[0].1["response"]["id"]);
    }

    #[tokio::test]
    async fn test_deltas_keep_order_across_reads() {
        let pieces = ["on", "e ", "tw", "o ✓"];
        let mut raw: String = pieces.iter().map(|p| chunk(p)).collect();
        raw.push_str("data: [DONE]\n\n");
        let reads: Vec<&[u8]> = raw.as_bytes().chunks(7).collect();

        let out = run(&reads, ResponsesReframer::new("gpt-4o")).await;
        let deltas: String = events(&out)
            .iter()
            .filter(|(n, _)| n == "response.output_text.delta")
            .map(|(_, p)| p["delta"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(deltas, "one two ✓");
    }

    #[tokio::test]
    async fn test_single_terminal_sequence() {
        let without_done = run(&[chunk("a").as_bytes()], ResponsesReframer::new("m")).await;
        let with_done = format!("{}data: [DONE]\n\n", chunk("a"));
        let with_done = run(&[with_done.as_bytes()], ResponsesReframer::new("m")).await;
        let twice = format!("{}data: [DONE]\n\ndata: [DONE]\n\n", chunk("a"));
        let twice = run(&[twice.as_bytes()], ResponsesReframer::new("m")).await;

        for out in [without_done, with_done, twice] {
            assert_eq!(out.matches("event: response.completed").count(), 1);
            assert_eq!(out.matches("event: response.created").count(), 1);
        }
    }

    #[tokio::test]
    async fn test_empty_stream_still_opens_and_completes() {
        let out = run(&[b"data: [DONE]\n\n"], ResponsesReframer::new("m")).await;
        let mut expected: Vec<&str> = GRAMMAR_HEAD.to_vec();
        expected.extend(GRAMMAR_TAIL);
        assert_eq!(names(&events(&out)), expected);
    }

    #[tokio::test]
    async fn test_usage_carried_into_completed() {
        let raw = format!(
            "{}data: {}\n\ndata: [DONE]\n\n",
            chunk("x"),
            json!({"choices": [], "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5}})
        );
        let out = run(&[raw.as_bytes()], ResponsesReframer::new("m")).await;
        let (_, completed) = events(&out).pop().unwrap();
        assert_eq!(
            completed["response"]["usage"],
            json!({"input_tokens": 4, "output_tokens": 1, "total_tokens": 5})
        );
    }

    #[tokio::test]
    async fn test_error_frame_fails_without_completion() {
        let raw = format!(
            "{}data: {{\"error\":{{\"message\":\"quota\",\"code\":\"rate_limited\"}}}}\n\n{}",
            chunk("a"),
            chunk("b")
        );
        let out = run(&[raw.as_bytes()], ResponsesReframer::new("m")).await;
        let events = events(&out);
        let (name, payload) = events.last().unwrap();
        assert_eq!(name, "error");
        assert_eq!(payload["message"], "quota");
        assert_eq!(payload["code"], "rate_limited");
        assert_eq!(payload["sequence_number"], events.len() as u64);
        assert!(!out.contains("response.completed"));
    }

    #[tokio::test]
    async fn test_error_before_any_output() {
        let out = run(
            &[b"data: {\"error\":\"bad\"}\n\n"],
            ResponsesReframer::new("m"),
        )
        .await;
        let events = events(&out);
        assert_eq!(names(&events), vec!["error"]);
        assert_eq!(events[0].1["sequence_number"], 1);
        assert_eq!(events[0].1["message"], "bad");
    }

    #[test]
    fn test_replay_emits_one_delta() {
        let frames = ResponsesReframer::replay("o3-mini", "answer", Some(ResponseUsage::new(3, 1)));
        let out: String = frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).to_string())
            .collect();
        let events = events(&out);

        let mut expected: Vec<&str> = GRAMMAR_HEAD.to_vec();
        expected.push("response.output_text.delta");
        expected.extend(GRAMMAR_TAIL);
        assert_eq!(names(&events), expected);
        assert_eq!(events[3].1["delta"], "answer");
        let completed = &events.last().unwrap().1;
        assert_eq!(completed["sequence_number"], 8);
        assert_eq!(completed["response"]["model"], "o3-mini");
        assert_eq!(completed["response"]["usage"]["total_tokens"], 4);
    }
}
