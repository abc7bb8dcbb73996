//! Anthropic Messages requests onto the upstream Responses endpoint, and back.

use serde_json::Value;

use super::anthropic::{ContentBlock, MessagesResponse, Role, StopReason, Usage};
use super::loose::{Loose, is_reasoning_model};
use super::responses::{InputContent, InputMessage, InputPart, UpstreamResponsesRequest};
use super::{extract_text, new_id, requested_model};
use crate::error::{Error, Result};

/// Convert an Anthropic Messages request into an upstream Responses request.
///
/// Tool use and tool result blocks are dropped.
pub fn responses_request_from_messages(body: &Value) -> Result<UpstreamResponsesRequest> {
    if !body.is_object() {
        return Err(Error::Validation(
            "request body must be a JSON object".to_string(),
        ));
    }

    let model = requested_model(body);

    let max_tokens = body
        .number_field("max_tokens")
        .filter(|n| *n > 0.0)
        .and_then(|_| body.field("max_tokens").cloned())
        .ok_or_else(|| {
            Error::Validation(
                "Anthropic /v1/messages requires `max_tokens` (number > 0).".to_string(),
            )
        })?;

    let input: Vec<InputMessage> = body
        .array_field("messages")
        .map(|messages| messages.iter().filter_map(convert_message).collect())
        .unwrap_or_default();
    if input.is_empty() {
        return Err(Error::Validation(
            "Anthropic /v1/messages requires non-empty `messages`.".to_string(),
        ));
    }

    Ok(UpstreamResponsesRequest {
        stream: body.bool_field("stream") == Some(true) && !is_reasoning_model(&model),
        model,
        input,
        instructions: body.field("system").and_then(join_system),
        max_output_tokens: max_tokens,
        temperature: body.field("temperature").filter(|v| !v.is_null()).cloned(),
        top_p: body.field("top_p").filter(|v| !v.is_null()).cloned(),
        stop: body
            .field("stop_sequences")
            .filter(|v| !v.is_null())
            .cloned(),
    })
}

/// String system prompts pass through; block arrays keep their text blocks,
/// newline-joined.
fn join_system(system: &Value) -> Option<String> {
    match system {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.str_field("type") == Some("text"))
                .filter_map(|b| b.str_field("text"))
                .collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

fn convert_message(message: &Value) -> Option<InputMessage> {
    if !message.is_object() {
        return None;
    }
    let role = message.str_field("role").unwrap_or("user").to_string();
    let content = match message.field("content") {
        Some(Value::String(text)) => InputContent::Text(text.clone()),
        Some(Value::Array(blocks)) => {
            InputContent::Parts(blocks.iter().filter_map(convert_block).collect())
        }
        _ => InputContent::Text(String::new()),
    };
    Some(InputMessage { role, content })
}

fn convert_block(block: &Value) -> Option<InputPart> {
    match block.str_field("type")? {
        "text" => Some(InputPart::InputText {
            text: block.str_field("text")?.to_string(),
        }),
        "image" => {
            let source = block.field("source")?;
            match source.str_field("type")? {
                "base64" => {
                    let media_type = source.str_field("media_type")?;
                    let data = source.str_field("data")?;
                    Some(InputPart::InputImage {
                        image_url: format!("data:{};base64,{}", media_type, data),
                    })
                }
                "url" => Some(InputPart::InputImage {
                    image_url: source.text_field("url")?.to_string(),
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Usage of a Responses body; missing counts read as 0.
pub fn usage_from_responses(response: &Value) -> Usage {
    let usage = response.field("usage");
    Usage {
        input_tokens: usage
            .and_then(|u| u.u64_field("input_tokens"))
            .unwrap_or(0),
        output_tokens: usage
            .and_then(|u| u.u64_field("output_tokens"))
            .unwrap_or(0),
    }
}

/// `max_tokens` when the response stopped on its output budget.
pub fn stop_reason_from_responses(response: &Value) -> StopReason {
    let incomplete = response.str_field("status") == Some("incomplete");
    let budget = response
        .path(&["incomplete_details", "reason"])
        .and_then(Value::as_str)
        == Some("max_output_tokens");
    if incomplete && budget {
        StopReason::MaxTokens
    } else {
        StopReason::EndTurn
    }
}

/// Convert an upstream Responses body into an Anthropic message.
pub fn message_from_responses(body: &Value, model: &str) -> MessagesResponse {
    MessagesResponse {
        id: new_id("msg_"),
        response_type: "message".to_string(),
        role: Role::Assistant,
        content: vec![ContentBlock::Text {
            text: extract_text(body),
        }],
        model: body.text_field("model").unwrap_or(model).to_string(),
        stop_reason: Some(stop_reason_from_responses(body)),
        stop_sequence: None,
        usage: usage_from_responses(body),
    }
}
