//! Chat Completions: client request passthrough and completion normalisation.

use serde_json::Value;

use super::loose::{Loose, is_reasoning_model};
use super::openai::{AssistantMessage, ChatCompletion, ChatRequest, CompletionChoice};
use super::{DEFAULT_MODEL, extract_text, new_id, synth_fingerprint, unix_now};
use crate::error::{Error, Result};

/// Chat request as forwarded upstream.
///
/// Everything the client sent is kept; only `stream` is rewritten to
/// `false` for reasoning models.
pub fn chat_request(body: &Value) -> Result<ChatRequest> {
    let mut map = body
        .as_object()
        .cloned()
        .ok_or_else(|| Error::Validation("request body must be a JSON object".to_string()))?;

    let model = map
        .remove("model")
        .and_then(|m| m.as_str().filter(|s| !s.is_empty()).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let messages = match map.remove("messages") {
        Some(Value::Array(messages)) => messages,
        _ => {
            return Err(Error::Validation(
                "`messages` must be an array".to_string(),
            ));
        }
    };

    let requested_stream = map.remove("stream").and_then(|s| s.as_bool()) == Some(true);
    let stream = requested_stream && !is_reasoning_model(&model);

    let tools = match map.remove("tools") {
        Some(Value::Array(tools)) => Some(tools),
        _ => None,
    };

    Ok(ChatRequest {
        stream,
        messages,
        temperature: map.remove("temperature"),
        top_p: map.remove("top_p"),
        max_tokens: map.remove("max_tokens"),
        tools,
        tool_choice: map.remove("tool_choice"),
        response_format: map.remove("response_format"),
        model,
        extra: map,
    })
}

/// Normalise an upstream chat body into a single-choice completion object.
pub fn completion_from_upstream(body: &Value, model: &str) -> ChatCompletion {
    let finish_reason = body
        .array_field("choices")
        .and_then(|c| c.first())
        .and_then(|c| c.text_field("finish_reason"))
        .unwrap_or("stop")
        .to_string();

    ChatCompletion {
        id: body
            .text_field("id")
            .map(str::to_string)
            .unwrap_or_else(|| new_id("chatcmpl-")),
        object: "chat.completion".to_string(),
        created: body.u64_field("created").unwrap_or_else(unix_now),
        model: body.text_field("model").unwrap_or(model).to_string(),
        system_fingerprint: body
            .text_field("system_fingerprint")
            .map(str::to_string)
            .unwrap_or_else(synth_fingerprint),
        choices: vec![CompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: extract_text(body),
            },
            finish_reason,
        }],
        usage: body.field("usage").filter(|u| u.is_object()).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_passthrough() {
        let body = json!({
            "model": "gpt-4.1",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "temperature": 0.2,
            "n": 1,
            "user": "abc"
        });
        let req = chat_request(&body).unwrap();
        assert!(req.stream);
        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["model"], "gpt-4.1");
        assert_eq!(out["messages"], body["messages"]);
        assert_eq!(out["temperature"], 0.2);
        assert_eq!(out["n"], 1);
        assert_eq!(out["user"], "abc");
        assert!(out.get("tools").is_none());
    }

    #[test]
    fn test_chat_request_reasoning_forces_no_stream() {
        for model in ["o1", "o1-preview", "o3-mini"] {
            let body = json!({"model": model, "messages": [], "stream": true});
            assert!(!chat_request(&body).unwrap().stream, "{}", model);
        }
    }

    #[test]
    fn test_chat_request_defaults_and_validation() {
        let req = chat_request(&json!({"messages": []})).unwrap();
        assert_eq!(req.model, "gpt-4o");
        assert!(!req.stream);

        assert!(matches!(
            chat_request(&json!({"model": "gpt-4o"})),
            Err(Error::Validation(_))
        ));
        assert!(matches!(chat_request(&json!([1])), Err(Error::Validation(_))));
    }

    #[test]
    fn test_completion_from_upstream_synthesises_ids() {
        let body = json!({
            "choices": [{"message": {"content": "answer"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        });
        let completion = completion_from_upstream(&body, "o3-mini");
        assert!(completion.id.starts_with("chatcmpl-"));
        assert!(completion.system_fingerprint.starts_with("fp_"));
        assert_eq!(completion.model, "o3-mini");
        assert_eq!(completion.text(), "answer");
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert_eq!(completion.usage.unwrap()["total_tokens"], 4);
    }

    #[test]
    fn test_completion_from_upstream_keeps_upstream_ids() {
        let body = json!({
            "id": "chatcmpl-up",
            "created": 42,
            "model": "o1-2024",
            "system_fingerprint": "fp_up",
            "choices": [{"message": {"content": "x"}, "finish_reason": "length"}]
        });
        let completion = completion_from_upstream(&body, "o1");
        assert_eq!(completion.id, "chatcmpl-up");
        assert_eq!(completion.created, 42);
        assert_eq!(completion.model, "o1-2024");
        assert_eq!(completion.system_fingerprint, "fp_up");
        assert_eq!(completion.choices[0].finish_reason, "length");
    }
}
