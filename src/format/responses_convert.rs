//! Conversion between the OpenAI Responses API and upstream chat completions.

use serde_json::{Map, Value, json};

use super::loose::{Loose, is_reasoning_model};
use super::openai::ChatRequest;
use super::responses::{OutputItem, OutputText, ResponseObject, ResponseUsage};
use super::{extract_text, new_id, requested_model, unix_now};
use crate::error::{Error, Result};

/// Convert a Responses API request into a chat request.
pub fn chat_request_from_responses(body: &Value) -> Result<ChatRequest> {
    if !body.is_object() {
        return Err(Error::Validation(
            "request body must be a JSON object".to_string(),
        ));
    }
    if body.bool_field("background") == Some(true) {
        return Err(Error::Validation(
            "background mode is not supported".to_string(),
        ));
    }

    let model = requested_model(body);
    let mut messages = Vec::new();

    if let Some(instructions) = body.text_field("instructions") {
        messages.push(json!({"role": "system", "content": instructions}));
    }
    let preamble = messages.len();

    match body.field("input") {
        Some(Value::String(text)) => {
            messages.push(json!({"role": "user", "content": text}));
        }
        Some(Value::Array(items)) => {
            messages.extend(items.iter().filter_map(input_item_to_message));
        }
        Some(_) => {}
        None => {
            if let Some(existing) = body.array_field("messages") {
                messages.extend(existing.iter().filter(|m| m.is_object()).cloned());
            }
        }
    }

    if messages.len() == preamble {
        return Err(Error::Validation(
            "no usable `input` or `messages` in request".to_string(),
        ));
    }

    let max_tokens = body
        .field("max_tokens")
        .or_else(|| body.field("max_output_tokens"))
        .filter(|v| v.is_number())
        .cloned();

    let tools = body.array_field("tools").map(|tools| {
        tools
            .iter()
            .filter_map(convert_tool)
            .collect::<Vec<_>>()
    });

    Ok(ChatRequest {
        stream: body.bool_field("stream") == Some(true) && !is_reasoning_model(&model),
        model,
        messages,
        temperature: non_null(body, "temperature"),
        top_p: non_null(body, "top_p"),
        max_tokens,
        tools: tools.filter(|t| !t.is_empty()),
        tool_choice: non_null(body, "tool_choice"),
        response_format: body.path(&["text", "format"]).and_then(response_format),
        extra: Map::new(),
    })
}

fn non_null(body: &Value, key: &str) -> Option<Value> {
    body.field(key).filter(|v| !v.is_null()).cloned()
}

/// One `input` item as a chat message; items without a role are dropped.
fn input_item_to_message(item: &Value) -> Option<Value> {
    if item
        .str_field("type")
        .is_some_and(|t| t != "message")
    {
        return None;
    }
    let role = match item.text_field("role")? {
        "developer" => "system",
        other => other,
    };
    let content = match item.field("content")? {
        Value::String(text) => Value::String(text.clone()),
        Value::Array(parts) => Value::Array(parts.iter().filter_map(convert_part).collect()),
        _ => return None,
    };
    Some(json!({"role": role, "content": content}))
}

fn convert_part(part: &Value) -> Option<Value> {
    match part.str_field("type")? {
        "input_text" | "output_text" | "text" => {
            let text = part.str_field("text")?;
            Some(json!({"type": "text", "text": text}))
        }
        "input_image" => {
            let url = part
                .str_field("image_url")
                .or_else(|| part.path(&["image_url", "url"]).and_then(Value::as_str))?;
            Some(json!({"type": "image_url", "image_url": {"url": url}}))
        }
        _ => None,
    }
}

/// Flat Responses function tools become nested chat tools.
fn convert_tool(tool: &Value) -> Option<Value> {
    if tool.str_field("type") != Some("function") {
        return None;
    }
    if tool.object_field("function").is_some() {
        return Some(tool.clone());
    }
    let mut function = Map::new();
    function.insert("name".to_string(), Value::String(tool.text_field("name")?.to_string()));
    for key in ["description", "parameters", "strict"] {
        if let Some(value) = tool.field(key).filter(|v| !v.is_null()) {
            function.insert(key.to_string(), value.clone());
        }
    }
    Some(json!({"type": "function", "function": function}))
}

/// `text.format` as a chat `response_format`.
fn response_format(format: &Value) -> Option<Value> {
    match format.str_field("type")? {
        "json_object" => Some(json!({"type": "json_object"})),
        "json_schema" => {
            let mut schema = Map::new();
            schema.insert(
                "name".to_string(),
                Value::String(format.text_field("name").unwrap_or("response").to_string()),
            );
            if let Some(s) = format.field("schema") {
                schema.insert("schema".to_string(), s.clone());
            }
            if let Some(strict) = format.bool_field("strict") {
                schema.insert("strict".to_string(), Value::Bool(strict));
            }
            Some(json!({"type": "json_schema", "json_schema": schema}))
        }
        _ => None,
    }
}

/// Token usage of a chat body, mapped to Responses names.
pub fn usage_from_chat(body: &Value) -> Option<ResponseUsage> {
    let usage = body.field("usage")?;
    let input = usage.u64_field("prompt_tokens").unwrap_or(0);
    let output = usage.u64_field("completion_tokens").unwrap_or(0);
    let mut mapped = ResponseUsage::new(input, output);
    if let Some(total) = usage.u64_field("total_tokens") {
        mapped.total_tokens = total;
    }
    Some(mapped)
}

/// Convert an upstream chat body into a completed Responses object.
pub fn response_from_chat(body: &Value, model: &str) -> ResponseObject {
    let item = OutputItem::message(
        &new_id("msg_"),
        "completed",
        vec![OutputText::new(extract_text(body))],
    );
    ResponseObject::new(
        &new_id("resp_"),
        body.text_field("model").unwrap_or(model),
        unix_now(),
        "completed",
        vec![item],
        usage_from_chat(body),
    )
}
