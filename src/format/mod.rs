//! Client and upstream wire shapes, and the translators between them.

pub mod anthropic;
pub mod anthropic_convert;
pub mod chat_convert;
pub mod loose;
pub mod openai;
pub mod responses;
pub mod responses_convert;

pub use anthropic_convert::{
    message_from_responses, responses_request_from_messages, stop_reason_from_responses,
    usage_from_responses,
};
pub use chat_convert::{chat_request, completion_from_upstream};
pub use loose::Loose;
pub use responses_convert::{chat_request_from_responses, response_from_chat, usage_from_chat};

use serde_json::Value;

/// Model used when a client request names none.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// `<prefix><uuid>`, e.g. `chatcmpl-…`, `resp_…`, `msg_…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4())
}

/// `fp_` followed by 12 hex digits.
pub fn synth_fingerprint() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("fp_{}", &simple[..12])
}

pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Model named by a client body, or the default.
pub fn requested_model(body: &Value) -> String {
    body.text_field("model").unwrap_or(DEFAULT_MODEL).to_string()
}

/// Whether the client asked for a streamed answer.
pub fn wants_stream(body: &Value) -> bool {
    body.bool_field("stream") == Some(true)
}

/// Assistant text of a chat or Responses body.
///
/// Chat bodies use `choices[0].message.content`; Responses bodies use the
/// message items in `output`, then a top-level `output_text`.
pub fn extract_text(body: &Value) -> String {
    if let Some(choice) = body.array_field("choices").and_then(|c| c.first()) {
        return choice
            .path(&["message", "content"])
            .map(content_text)
            .unwrap_or_default();
    }

    if let Some(output) = body.array_field("output") {
        let text: String = output
            .iter()
            .filter(|item| item.str_field("type").is_none_or(|t| t == "message"))
            .filter_map(|item| item.field("content"))
            .map(content_text)
            .collect();
        if !text.is_empty() {
            return text;
        }
    }

    body.str_field("output_text").unwrap_or_default().to_string()
}

/// Text of a content value: a plain string, or the text parts of an array.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| matches!(p.str_field("type"), Some("text" | "output_text" | "input_text")))
            .filter_map(|p| p.str_field("text"))
            .collect(),
        _ => String::new(),
    }
}
