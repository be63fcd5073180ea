//! OpenAI chat-completions dialect codec.
//!
//! The lossy boundary of the system: this wire has no native thinking block,
//! so reasoning travels as an out-of-band `reasoning_content` field that
//! clients may ignore and signatures cannot cross at all.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::model::{
    normalize_tool_schema, ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason,
    ToolDefinition, Usage, EMPTY_MESSAGE_PLACEHOLDER,
};
use crate::{Result, TranslateError};

const DEFAULT_MAX_TOKENS: u32 = 4_096;

// ── Inbound request ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    max_completion_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stop: Option<Value>,
    #[serde(default)]
    tools: Vec<Value>,
    /// Non-standard passthrough used by proxy-aware clients.
    #[serde(default)]
    thinking: Option<Value>,
    #[serde(default)]
    reasoning_effort: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Parse an OpenAI chat-completions request into the internal shape.
///
/// `lenient` drops unknown content parts instead of rejecting the request.
pub fn parse_request(body: &Value, lenient: bool) -> Result<ChatRequest> {
    let wire: WireRequest = serde_json::from_value(body.clone())
        .map_err(|e| TranslateError::Malformed(e.to_string()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for m in wire.messages {
        match m.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &m.content {
                    system_parts.push(content_to_text(content));
                }
            }
            "user" => messages.push(Message::user(parse_user_content(m.content.as_ref(), lenient)?)),
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(reasoning) = m.reasoning_content.filter(|r| !r.is_empty()) {
                    // Reasoning re-enters without a signature; recovery is the
                    // sanitizer's problem.
                    blocks.push(ContentBlock::Thinking {
                        thinking: reasoning,
                        signature: None,
                        redacted: false,
                    });
                }
                if let Some(content) = &m.content {
                    let text = content_to_text(content);
                    if !text.is_empty() {
                        blocks.push(ContentBlock::text(text));
                    }
                }
                for call in m.tool_calls {
                    let input = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input,
                    });
                }
                messages.push(Message::assistant(blocks));
            }
            "tool" => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: m.tool_call_id.unwrap_or_default(),
                    content: m
                        .content
                        .map(|c| Value::String(content_to_text(&c)))
                        .unwrap_or(Value::Null),
                    is_error: false,
                };
                // Group consecutive tool outputs into one user turn, matching
                // how the block dialects carry them.
                match messages.last_mut() {
                    Some(prev)
                        if prev.role == Role::User
                            && prev.content.iter().all(|b| {
                                matches!(b, ContentBlock::ToolResult { .. })
                            }) =>
                    {
                        prev.content.push(block);
                    }
                    _ => messages.push(Message::user(vec![block])),
                }
            }
            other => {
                return Err(TranslateError::Malformed(format!(
                    "unsupported role '{other}'"
                )))
            }
        }
    }

    let stop_sequences = match wire.stop {
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    };

    let tools = wire
        .tools
        .iter()
        .filter_map(|t| {
            let f = t.get("function")?;
            Some(ToolDefinition {
                name: f.get("name")?.as_str()?.to_string(),
                description: f
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: f.get("parameters").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();

    let thinking_budget = parse_thinking(wire.thinking.as_ref(), wire.reasoning_effort.as_deref());

    Ok(ChatRequest {
        model: wire.model,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        messages,
        max_tokens: wire
            .max_completion_tokens
            .or(wire.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        stream: wire.stream,
        temperature: wire.temperature,
        top_p: wire.top_p,
        stop_sequences,
        thinking_budget,
        tools,
    })
}

/// Thinking enablement on this dialect: either the non-standard `thinking`
/// object proxies forward, or a `reasoning_effort` slug mapped to a budget.
fn parse_thinking(thinking: Option<&Value>, effort: Option<&str>) -> Option<u32> {
    if let Some(t) = thinking {
        if t.get("type").and_then(Value::as_str) == Some("enabled") {
            return Some(
                t.get("budget_tokens")
                    .and_then(Value::as_u64)
                    .map(|b| b as u32)
                    .unwrap_or(8_192),
            );
        }
        return None;
    }
    match effort {
        Some("low") => Some(4_096),
        Some("medium") => Some(8_192),
        Some("high") => Some(16_384),
        _ => None,
    }
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| {
                if i.get("type").and_then(Value::as_str) == Some("text") {
                    i.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn parse_user_content(content: Option<&Value>, lenient: bool) -> Result<Vec<ContentBlock>> {
    let Some(content) = content else {
        return Ok(vec![ContentBlock::text(EMPTY_MESSAGE_PLACEHOLDER)]);
    };
    match content {
        Value::String(s) => Ok(vec![ContentBlock::text(s.clone())]),
        Value::Array(items) => {
            let mut blocks = Vec::new();
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => blocks.push(ContentBlock::text(
                        item.get("text").and_then(Value::as_str).unwrap_or_default(),
                    )),
                    Some("image_url") => {
                        let url = item
                            .pointer("/image_url/url")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        blocks.push(parse_image_url(url));
                    }
                    other if lenient => {
                        tracing::debug!(kind = other.unwrap_or("missing"), "dropping unsupported content part");
                    }
                    other => {
                        return Err(TranslateError::UnsupportedBlock(
                            other.unwrap_or("missing").to_string(),
                        ))
                    }
                }
            }
            Ok(blocks)
        }
        other => Err(TranslateError::Malformed(format!(
            "content must be a string or array, got {other}"
        ))),
    }
}

/// Data URLs decode into inline images; remote URLs degrade to a text
/// reference (the block dialects carry base64 only).
fn parse_image_url(url: &str) -> ContentBlock {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(";base64,") {
            return ContentBlock::Image {
                media_type: meta.to_string(),
                data: data.to_string(),
            };
        }
    }
    ContentBlock::text(url)
}

// ── Outbound request ─────────────────────────────────────────────────────────

/// Build an OpenAI chat-completions request body from the internal shape.
pub fn encode_request(req: &ChatRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = &req.system {
        if !system.is_empty() {
            messages.push(json!({ "role": "system", "content": system }));
        }
    }

    for m in &req.messages {
        match m.role {
            Role::Assistant => encode_assistant_message(m, &mut messages),
            _ => encode_user_message(m, &mut messages),
        }
    }

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": req.stream,
    });

    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if !req.stop_sequences.is_empty() {
        body["stop"] = json!(req.stop_sequences);
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": normalize_tool_schema(t),
                    },
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }

    body
}

fn encode_assistant_message(m: &Message, out: &mut Vec<Value>) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut reasoning_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in &m.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            // Signatures cannot cross this boundary; only the visible
            // reasoning text is carried.
            ContentBlock::Thinking { thinking, .. } => {
                if !thinking.is_empty() {
                    reasoning_parts.push(thinking);
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": input.to_string(),
                    },
                }));
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Image { .. } => {}
        }
    }

    let mut msg = json!({ "role": "assistant" });
    let text = text_parts.join("");
    msg["content"] = if text.is_empty() {
        Value::Null
    } else {
        json!(text)
    };
    if !reasoning_parts.is_empty() {
        msg["reasoning_content"] = json!(reasoning_parts.join(""));
    }
    if !tool_calls.is_empty() {
        msg["tool_calls"] = Value::Array(tool_calls);
    }
    out.push(msg);
}

fn encode_user_message(m: &Message, out: &mut Vec<Value>) {
    let mut parts: Vec<Value> = Vec::new();
    let mut has_image = false;

    for block in &m.content {
        match block {
            ContentBlock::Text { text } => {
                parts.push(json!({ "type": "text", "text": text }));
            }
            ContentBlock::Image { media_type, data } => {
                has_image = true;
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{media_type};base64,{data}") },
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                // Tool outputs are their own wire messages on this dialect.
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": tool_result_text(content),
                }));
            }
            ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } => {}
        }
    }

    if parts.is_empty() {
        return;
    }
    let content = if has_image || parts.len() > 1 {
        Value::Array(parts)
    } else {
        let text = parts[0]["text"].as_str().unwrap_or_default();
        json!(if text.trim().is_empty() {
            EMPTY_MESSAGE_PLACEHOLDER
        } else {
            text
        })
    };
    out.push(json!({ "role": "user", "content": content }));
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        other => other.to_string(),
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Parse an upstream OpenAI response into the internal shape.
pub fn parse_response(body: &Value) -> Result<ChatResponse> {
    let wire: WireResponse = serde_json::from_value(body.clone())
        .map_err(|e| TranslateError::Malformed(e.to_string()))?;

    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TranslateError::Malformed("response without choices".into()))?;

    let mut content = Vec::new();
    if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
        content.push(ContentBlock::Thinking {
            thinking: reasoning,
            signature: None,
            redacted: false,
        });
    }
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(ContentBlock::text(text));
    }
    for call in choice.message.tool_calls {
        let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    Ok(ChatResponse {
        model: wire.model,
        content,
        // A response with no finish reason was cut off somewhere upstream.
        stop_reason: choice
            .finish_reason
            .as_deref()
            .map(StopReason::from_openai)
            .unwrap_or(StopReason::Other),
        usage: wire
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
    })
}

/// Encode an internal response as an OpenAI chat completion.
pub fn encode_response(resp: &ChatResponse, id: &str, created: i64) -> Value {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut reasoning_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in &resp.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::Thinking { thinking, .. } => {
                if !thinking.is_empty() {
                    reasoning_parts.push(thinking);
                }
            }
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": input.to_string() },
            })),
            _ => {}
        }
    }

    let mut message = json!({
        "role": "assistant",
        "content": text_parts.join(""),
    });
    if !reasoning_parts.is_empty() {
        message["reasoning_content"] = json!(reasoning_parts.join(""));
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": resp.stop_reason.as_openai(),
        }],
        "usage": {
            "prompt_tokens": resp.usage.input_tokens,
            "completion_tokens": resp.usage.output_tokens,
            "total_tokens": resp.usage.input_tokens + resp.usage.output_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_request() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hi" }
            ],
            "max_tokens": 512
        });
        let req = parse_request(&body, false).unwrap();
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.max_tokens, 512);
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "user", "content": "read it" },
                { "role": "assistant", "tool_calls": [
                    { "id": "call_1", "type": "function",
                      "function": { "name": "read_file", "arguments": "{\"path\":\"/x\"}" } }
                ]},
                { "role": "tool", "tool_call_id": "call_1", "content": "data" }
            ]
        });
        let req = parse_request(&body, false).unwrap();
        assert_eq!(req.messages.len(), 3);
        match &req.messages[1].content[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "read_file");
                assert_eq!(input["path"], "/x");
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &req.messages[2].content[0] {
            ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "call_1"),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn consecutive_tool_messages_merge() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "tool", "tool_call_id": "a", "content": "1" },
                { "role": "tool", "tool_call_id": "b", "content": "2" }
            ]
        });
        let req = parse_request(&body, false).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].content.len(), 2);
    }

    #[test]
    fn reasoning_content_parses_as_unsigned_thinking() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "assistant", "content": "answer", "reasoning_content": "because" }
            ]
        });
        let req = parse_request(&body, false).unwrap();
        match &req.messages[0].content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
                ..
            } => {
                assert_eq!(thinking, "because");
                assert!(signature.is_none());
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn reasoning_effort_maps_to_budget() {
        let body = json!({
            "model": "gpt-4o",
            "reasoning_effort": "high",
            "messages": [{ "role": "user", "content": "hi" }]
        });
        assert_eq!(parse_request(&body, false).unwrap().thinking_budget, Some(16_384));
    }

    #[test]
    fn data_url_images_round_trip() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "what is this" },
                    { "type": "image_url",
                      "image_url": { "url": "data:image/png;base64,aGVsbG8=" } }
                ]
            }]
        });
        let req = parse_request(&body, false).unwrap();
        match &req.messages[0].content[1] {
            ContentBlock::Image { media_type, data } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "aGVsbG8=");
            }
            other => panic!("unexpected block: {other:?}"),
        }

        let encoded = encode_request(&req);
        let url = encoded["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert_eq!(url, "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn encode_emits_tool_messages_separately() {
        let req = ChatRequest {
            model: "gpt-4o".into(),
            system: None,
            messages: vec![Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".into(),
                content: json!("output"),
                is_error: false,
            }])],
            max_tokens: 1024,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: vec![],
            thinking_budget: None,
            tools: vec![],
        };
        let body = encode_request(&req);
        assert_eq!(body["messages"][0]["role"], "tool");
        assert_eq!(body["messages"][0]["tool_call_id"], "call_1");
    }

    #[test]
    fn response_parse_and_encode() {
        let body = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "done",
                    "tool_calls": [
                        { "id": "call_9", "type": "function",
                          "function": { "name": "t", "arguments": "{}" } }
                    ]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 7 }
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.usage.output_tokens, 7);

        let encoded = encode_response(&resp, "chatcmpl-1", 1_700_000_000);
        assert_eq!(encoded["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(encoded["usage"]["total_tokens"], 10);
    }
}
