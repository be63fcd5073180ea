//! Anthropic messages dialect codec.
//!
//! Content is always a list of typed blocks on this wire; the system prompt
//! is a top-level field and tool outputs travel as `tool_result` blocks in
//! user messages.

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
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    system: Option<Value>,
    messages: Vec<WireMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stop_sequences: Vec<String>,
    #[serde(default)]
    thinking: Option<WireThinking>,
    #[serde(default)]
    tools: Vec<WireTool>,
}

#[derive(Deserialize)]
struct WireMessage {
    role: String,
    content: Value,
}

#[derive(Deserialize)]
struct WireThinking {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    budget_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
}

/// Parse an Anthropic messages request body into the internal shape.
///
/// `lenient` drops content blocks of unknown type instead of rejecting the
/// request (the compatibility-mode behavior for clients that attach custom
/// block kinds).
pub fn parse_request(body: &Value, lenient: bool) -> Result<ChatRequest> {
    let wire: WireRequest = serde_json::from_value(body.clone())
        .map_err(|e| TranslateError::Malformed(e.to_string()))?;

    let system = wire.system.map(|s| system_to_string(&s));

    let mut messages = Vec::with_capacity(wire.messages.len());
    for (i, m) in wire.messages.into_iter().enumerate() {
        let role = match m.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(TranslateError::Malformed(format!(
                    "message {i}: unsupported role '{other}'"
                )))
            }
        };
        messages.push(Message {
            role,
            content: parse_content(&m.content, lenient)?,
        });
    }

    let thinking_budget = wire.thinking.and_then(|t| match t.kind.as_str() {
        "enabled" => Some(t.budget_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        _ => None,
    });

    Ok(ChatRequest {
        model: wire.model,
        system,
        messages,
        max_tokens: wire.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stream: wire.stream,
        temperature: wire.temperature,
        top_p: wire.top_p,
        stop_sequences: wire.stop_sequences,
        thinking_budget,
        tools: wire
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect(),
    })
}

fn system_to_string(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Parse string-or-array message content into typed blocks.
///
/// Unknown block fields (cache_control and other client passthroughs) are
/// dropped here — only the typed fields survive. With `lenient`, whole
/// blocks of unknown type are dropped too.
pub fn parse_content(content: &Value, lenient: bool) -> Result<Vec<ContentBlock>> {
    match content {
        Value::String(s) => Ok(vec![ContentBlock::text(s.clone())]),
        Value::Array(items) => {
            let mut blocks = Vec::with_capacity(items.len());
            for item in items {
                match parse_block(item) {
                    Ok(block) => blocks.push(block),
                    Err(TranslateError::UnsupportedBlock(kind)) if lenient => {
                        tracing::debug!(kind, "dropping unsupported content block");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(blocks)
        }
        other => Err(TranslateError::Malformed(format!(
            "content must be a string or array, got {other}"
        ))),
    }
}

fn parse_block(block: &Value) -> Result<ContentBlock> {
    let kind = block
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| TranslateError::Malformed("content block without type".into()))?;

    match kind {
        "text" => Ok(ContentBlock::Text {
            text: block
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "thinking" => Ok(ContentBlock::Thinking {
            thinking: block
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            signature: block
                .get("signature")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
            redacted: false,
        }),
        "redacted_thinking" => Ok(ContentBlock::Thinking {
            thinking: String::new(),
            signature: block
                .get("data")
                .and_then(Value::as_str)
                .map(String::from),
            redacted: true,
        }),
        "tool_use" => Ok(ContentBlock::ToolUse {
            id: block
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Ok(ContentBlock::ToolResult {
            tool_use_id: block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: block.get("content").cloned().unwrap_or(Value::Null),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        "image" => {
            let source = block.get("source").unwrap_or(&Value::Null);
            Ok(ContentBlock::Image {
                media_type: source
                    .get("media_type")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string(),
                data: source
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
        other => Err(TranslateError::UnsupportedBlock(other.to_string())),
    }
}

// ── Outbound request ─────────────────────────────────────────────────────────

/// Build an Anthropic messages request body from the internal shape.
pub fn encode_request(req: &ChatRequest) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                },
                "content": blocks_to_wire(&m.content),
            })
        })
        .collect();

    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "messages": messages,
        "stream": req.stream,
    });

    if let Some(system) = &req.system {
        if !system.is_empty() {
            body["system"] = json!(system);
        }
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if !req.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(req.stop_sequences);
    }
    if let Some(budget) = req.thinking_budget {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": normalize_tool_schema(t),
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }

    body
}

/// Encode typed blocks back to the Anthropic wire shape.
pub fn blocks_to_wire(blocks: &[ContentBlock]) -> Value {
    if blocks.is_empty() {
        return json!([{ "type": "text", "text": EMPTY_MESSAGE_PLACEHOLDER }]);
    }
    let items: Vec<Value> = blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => {
                let text = if text.trim().is_empty() {
                    EMPTY_MESSAGE_PLACEHOLDER
                } else {
                    text
                };
                json!({ "type": "text", "text": text })
            }
            ContentBlock::Thinking {
                thinking,
                signature,
                redacted,
            } => {
                if *redacted {
                    json!({
                        "type": "redacted_thinking",
                        "data": signature.as_deref().unwrap_or_default(),
                    })
                } else {
                    let mut block = json!({ "type": "thinking", "thinking": thinking });
                    if let Some(sig) = signature {
                        block["signature"] = json!(sig);
                    }
                    block
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                json!({ "type": "tool_use", "id": id, "name": name, "input": input })
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                });
                if *is_error {
                    block["is_error"] = json!(true);
                }
                block
            }
            ContentBlock::Image { media_type, data } => json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            }),
        })
        .collect();
    Value::Array(items)
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireResponse {
    model: String,
    content: Vec<Value>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Parse an upstream Anthropic response into the internal shape.
pub fn parse_response(body: &Value) -> Result<ChatResponse> {
    let wire: WireResponse = serde_json::from_value(body.clone())
        .map_err(|e| TranslateError::Malformed(e.to_string()))?;

    let content = wire
        .content
        .iter()
        .map(parse_block)
        .collect::<Result<Vec<_>>>()?;

    Ok(ChatResponse {
        model: wire.model,
        content,
        // A response with no stop reason was cut off somewhere upstream.
        stop_reason: wire
            .stop_reason
            .as_deref()
            .map(StopReason::from_anthropic)
            .unwrap_or(StopReason::Other),
        usage: Usage {
            input_tokens: wire.usage.input_tokens,
            output_tokens: wire.usage.output_tokens,
        },
    })
}

/// Encode an internal response as an Anthropic messages response.
pub fn encode_response(resp: &ChatResponse, id: &str) -> Value {
    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": resp.model,
        "content": blocks_to_wire(&resp.content),
        "stop_reason": resp.stop_reason.as_anthropic(),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": resp.usage.input_tokens,
            "output_tokens": resp.usage.output_tokens,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_block_content() {
        let body = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": [
                    { "type": "thinking", "thinking": "hmm", "signature": "s".repeat(20) },
                    { "type": "text", "text": "hello" }
                ]}
            ]
        });
        let req = parse_request(&body, false).unwrap();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].content, vec![ContentBlock::text("hi")]);
        assert!(req.messages[1].content[0].is_thinking());
    }

    #[test]
    fn thinking_enabled_maps_to_budget() {
        let body = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "thinking": { "type": "enabled", "budget_tokens": 8192 },
            "messages": [{ "role": "user", "content": "hi" }]
        });
        let req = parse_request(&body, false).unwrap();
        assert_eq!(req.thinking_budget, Some(8192));

        let body = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1024,
            "thinking": { "type": "disabled" },
            "messages": [{ "role": "user", "content": "hi" }]
        });
        assert_eq!(parse_request(&body, false).unwrap().thinking_budget, None);
    }

    #[test]
    fn cache_control_is_dropped() {
        let content = json!([
            { "type": "text", "text": "hi", "cache_control": { "type": "ephemeral" } }
        ]);
        let blocks = parse_content(&content, false).unwrap();
        assert_eq!(blocks, vec![ContentBlock::text("hi")]);
    }

    #[test]
    fn empty_text_becomes_placeholder() {
        let wire = blocks_to_wire(&[ContentBlock::text("  ")]);
        assert_eq!(wire[0]["text"], EMPTY_MESSAGE_PLACEHOLDER);
        let wire = blocks_to_wire(&[]);
        assert_eq!(wire[0]["text"], EMPTY_MESSAGE_PLACEHOLDER);
    }

    #[test]
    fn encode_request_includes_thinking_and_tools() {
        let req = ChatRequest {
            model: "claude-sonnet-4".into(),
            system: Some("be brief".into()),
            messages: vec![Message::user(vec![ContentBlock::text("hi")])],
            max_tokens: 2048,
            stream: true,
            temperature: Some(0.5),
            top_p: None,
            stop_sequences: vec![],
            thinking_budget: Some(4096),
            tools: vec![ToolDefinition {
                name: "read_file".into(),
                description: "reads".into(),
                input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            }],
        };
        let body = encode_request(&req);
        assert_eq!(body["thinking"]["budget_tokens"], 4096);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["tools"][0]["name"], "read_file");
    }

    #[test]
    fn response_round_trip() {
        let body = json!({
            "model": "claude-sonnet-4",
            "content": [
                { "type": "thinking", "thinking": "let me think", "signature": "x".repeat(64) },
                { "type": "text", "text": "done" },
                { "type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {"path": "/x"} }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 10, "output_tokens": 20 }
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.content.len(), 3);

        let encoded = encode_response(&resp, "msg_1");
        assert_eq!(encoded["content"][2]["id"], "toolu_1");
        assert_eq!(encoded["stop_reason"], "tool_use");
        assert_eq!(encoded["usage"]["output_tokens"], 20);
    }

    #[test]
    fn lenient_mode_drops_unknown_blocks() {
        let content = json!([
            { "type": "text", "text": "hi" },
            { "type": "client_custom_widget", "payload": {} }
        ]);
        assert!(parse_content(&content, false).is_err());
        let blocks = parse_content(&content, true).unwrap();
        assert_eq!(blocks, vec![ContentBlock::text("hi")]);
    }

    #[test]
    fn redacted_thinking_round_trips_as_marker() {
        let content = json!([{ "type": "redacted_thinking", "data": "opaque-bytes" }]);
        let blocks = parse_content(&content, false).unwrap();
        match &blocks[0] {
            ContentBlock::Thinking {
                redacted,
                signature,
                ..
            } => {
                assert!(redacted);
                assert_eq!(signature.as_deref(), Some("opaque-bytes"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
        let wire = blocks_to_wire(&blocks);
        assert_eq!(wire[0]["type"], "redacted_thinking");
        assert_eq!(wire[0]["data"], "opaque-bytes");
    }
}
