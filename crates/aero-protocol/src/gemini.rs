//! Gemini-native generateContent dialect codec.
//!
//! Thought parts carry `thought: true` plus an opaque `thoughtSignature`; the
//! signature sometimes arrives on a bare part of its own, and function calls
//! have no ids on this wire — ids are derived deterministically from
//! (name, args) so they stay stable across retries.

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::model::{
    normalize_tool_schema, tool_call_id, ChatRequest, ChatResponse, ContentBlock, Message, Role,
    StopReason, ToolDefinition, Usage, EMPTY_MESSAGE_PLACEHOLDER,
};
use crate::{Result, TranslateError};

const DEFAULT_MAX_TOKENS: u32 = 8_192;

// ── Inbound request ──────────────────────────────────────────────────────────

/// Parse a Gemini-native request body into the internal shape.
///
/// `model` comes from the URL path on this wire, not the body.
pub fn parse_request(model: &str, body: &Value) -> Result<ChatRequest> {
    let contents = body
        .get("contents")
        .and_then(Value::as_array)
        .ok_or_else(|| TranslateError::Malformed("missing contents".into()))?;

    let system = body
        .pointer("/systemInstruction/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.is_empty());

    // Function calls on this wire have no ids; remember the ids we mint per
    // tool name so functionResponse parts pair back up.
    let mut pending_ids: HashMap<String, Vec<String>> = HashMap::new();
    let mut messages = Vec::with_capacity(contents.len());

    for content in contents {
        let role = match content.get("role").and_then(Value::as_str) {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let parts = content
            .get("parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut blocks: Vec<ContentBlock> = Vec::new();
        for part in &parts {
            parse_part(part, &mut blocks, &mut pending_ids)?;
        }
        messages.push(Message { role, content: blocks });
    }

    let gen = body.get("generationConfig").cloned().unwrap_or(json!({}));
    let thinking_budget = gen
        .pointer("/thinkingConfig/thinkingBudget")
        .and_then(Value::as_u64)
        .filter(|b| *b > 0)
        .map(|b| b as u32);

    let stop_sequences = gen
        .get("stopSequences")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .flat_map(|t| {
                    t.get("functionDeclarations")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default()
                })
                .filter_map(|decl| {
                    Some(ToolDefinition {
                        name: decl.get("name")?.as_str()?.to_string(),
                        description: decl
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input_schema: decl.get("parameters").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatRequest {
        model: model.to_string(),
        system,
        messages,
        max_tokens: gen
            .get("maxOutputTokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        stream: false,
        temperature: gen.get("temperature").and_then(Value::as_f64),
        top_p: gen.get("topP").and_then(Value::as_f64),
        stop_sequences,
        thinking_budget,
        tools,
    })
}

fn parse_part(
    part: &Value,
    blocks: &mut Vec<ContentBlock>,
    pending_ids: &mut HashMap<String, Vec<String>>,
) -> Result<()> {
    let signature = part
        .get("thoughtSignature")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    if let Some(call) = part.get("functionCall") {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
        let id = tool_call_id(&name, &args);
        pending_ids.entry(name.clone()).or_default().push(id.clone());
        if let Some(sig) = signature {
            attach_signature(blocks, sig);
        }
        blocks.push(ContentBlock::ToolUse {
            id,
            name,
            input: args,
        });
        return Ok(());
    }

    if let Some(resp) = part.get("functionResponse") {
        let name = resp
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = pending_ids
            .get_mut(&name)
            .and_then(|ids| if ids.is_empty() { None } else { Some(ids.remove(0)) })
            .unwrap_or_else(|| tool_call_id(&name, &Value::Null));
        blocks.push(ContentBlock::ToolResult {
            tool_use_id: id,
            content: resp.get("response").cloned().unwrap_or(Value::Null),
            is_error: false,
        });
        return Ok(());
    }

    if let Some(inline) = part.get("inlineData") {
        blocks.push(ContentBlock::Image {
            media_type: inline
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png")
                .to_string(),
            data: inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
        return Ok(());
    }

    let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
    let text = part.get("text").and_then(Value::as_str).unwrap_or_default();

    if is_thought {
        blocks.push(ContentBlock::Thinking {
            thinking: text.to_string(),
            signature,
            redacted: false,
        });
    } else if let Some(sig) = signature {
        if text.is_empty() {
            // Bare trailing-signature part: attach to the open thinking block,
            // or keep as an empty signed marker.
            attach_signature(blocks, sig);
        } else {
            blocks.push(ContentBlock::text(text));
            attach_signature(blocks, sig);
        }
    } else if !text.is_empty() {
        blocks.push(ContentBlock::text(text));
    }

    Ok(())
}

/// Attach a late-arriving signature to the most recent thinking block, or
/// record it as an empty signed thinking marker. Function-call parts repeat
/// the turn signature; a repeat of an already-attached value is a no-op.
fn attach_signature(blocks: &mut Vec<ContentBlock>, sig: String) {
    for block in blocks.iter_mut().rev() {
        if let ContentBlock::Thinking { signature, .. } = block {
            match signature {
                None => {
                    *signature = Some(sig);
                    return;
                }
                Some(existing) if *existing == sig => return,
                Some(_) => break,
            }
        }
    }
    blocks.push(ContentBlock::Thinking {
        thinking: String::new(),
        signature: Some(sig),
        redacted: false,
    });
}

// ── Outbound request ─────────────────────────────────────────────────────────

/// Build a Gemini-native request body from the internal shape.
pub fn encode_request(req: &ChatRequest) -> Value {
    // functionResponse parts need the tool name back; index it from the
    // tool_use blocks across the whole history.
    let mut names_by_id: HashMap<&str, &str> = HashMap::new();
    for m in &req.messages {
        for b in &m.content {
            if let ContentBlock::ToolUse { id, name, .. } = b {
                names_by_id.insert(id, name);
            }
        }
    }

    let contents: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                },
                "parts": message_parts(m, &names_by_id),
            })
        })
        .collect();

    let mut gen = json!({ "maxOutputTokens": req.max_tokens });
    if let Some(t) = req.temperature {
        gen["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        gen["topP"] = json!(p);
    }
    if !req.stop_sequences.is_empty() {
        gen["stopSequences"] = json!(req.stop_sequences);
    }
    if let Some(budget) = req.thinking_budget {
        gen["thinkingConfig"] = json!({
            "thinkingBudget": budget,
            "includeThoughts": true,
        });
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": gen,
    });

    if let Some(system) = &req.system {
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
    }
    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": normalize_tool_schema(t),
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    body
}

fn message_parts(m: &Message, names_by_id: &HashMap<&str, &str>) -> Vec<Value> {
    // Function calls on this wire must carry the turn's thinking signature.
    let turn_signature = m.content.iter().find_map(|b| match b {
        ContentBlock::Thinking {
            signature: Some(sig),
            ..
        } => Some(sig.clone()),
        _ => None,
    });

    let mut parts: Vec<Value> = Vec::new();
    for block in &m.content {
        match block {
            ContentBlock::Text { text } => {
                let text = if text.trim().is_empty() {
                    EMPTY_MESSAGE_PLACEHOLDER
                } else {
                    text
                };
                parts.push(json!({ "text": text }));
            }
            ContentBlock::Thinking {
                thinking,
                signature,
                ..
            } => {
                let mut part = json!({ "text": thinking, "thought": true });
                if let Some(sig) = signature {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            ContentBlock::ToolUse { name, input, .. } => {
                let mut part = json!({
                    "functionCall": { "name": name, "args": input },
                });
                if let Some(sig) = &turn_signature {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let name = names_by_id
                    .get(tool_use_id.as_str())
                    .copied()
                    .unwrap_or(tool_use_id.as_str());
                let response = match content {
                    Value::Object(_) => content.clone(),
                    other => json!({ "output": other }),
                };
                parts.push(json!({
                    "functionResponse": { "name": name, "response": response },
                }));
            }
            ContentBlock::Image { media_type, data } => {
                parts.push(json!({
                    "inlineData": { "mimeType": media_type, "data": data },
                }));
            }
        }
    }

    if parts.is_empty() {
        parts.push(json!({ "text": EMPTY_MESSAGE_PLACEHOLDER }));
    }
    parts
}

// ── Responses ────────────────────────────────────────────────────────────────

/// Parse an upstream Gemini response into the internal shape.
pub fn parse_response(model: &str, body: &Value) -> Result<ChatResponse> {
    // Some upstream proxies wrap the payload in a `response` envelope.
    let body = body.get("response").unwrap_or(body);

    let candidate = body
        .pointer("/candidates/0")
        .ok_or_else(|| TranslateError::Malformed("response without candidates".into()))?;

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut pending_ids = HashMap::new();
    let mut content = Vec::new();
    for part in &parts {
        parse_part(part, &mut content, &mut pending_ids)?;
    }

    let has_tool_use = content.iter().any(ContentBlock::is_tool_use);
    let stop_reason = match candidate.get("finishReason").and_then(Value::as_str) {
        Some(reason) => {
            let mapped = StopReason::from_gemini(reason);
            if mapped == StopReason::EndTurn && has_tool_use {
                StopReason::ToolUse
            } else {
                mapped
            }
        }
        None if has_tool_use => StopReason::ToolUse,
        // A response with no finish reason was cut off somewhere upstream.
        None => StopReason::Other,
    };

    let usage = body
        .get("usageMetadata")
        .map(|u| Usage {
            input_tokens: u
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            output_tokens: u
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        model: model.to_string(),
        content,
        stop_reason,
        usage,
    })
}

/// Encode an internal response in the Gemini-native shape.
pub fn encode_response(resp: &ChatResponse) -> Value {
    let names_by_id = HashMap::new();
    let message = Message::assistant(resp.content.clone());
    json!({
        "candidates": [{
            "content": {
                "role": "model",
                "parts": message_parts(&message, &names_by_id),
            },
            "finishReason": resp.stop_reason.as_gemini(),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": resp.usage.input_tokens,
            "candidatesTokenCount": resp.usage.output_tokens,
            "totalTokenCount": resp.usage.input_tokens + resp.usage.output_tokens,
        },
        "modelVersion": resp.model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thought_parts_with_signature() {
        let body = json!({
            "contents": [{
                "role": "model",
                "parts": [
                    { "text": "reasoning...", "thought": true, "thoughtSignature": "sig-1234567890" },
                    { "text": "answer" }
                ]
            }]
        });
        let req = parse_request("gemini-2.5-pro", &body).unwrap();
        match &req.messages[0].content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
                ..
            } => {
                assert_eq!(thinking, "reasoning...");
                assert_eq!(signature.as_deref(), Some("sig-1234567890"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn bare_signature_part_attaches_to_open_thinking() {
        let body = json!({
            "contents": [{
                "role": "model",
                "parts": [
                    { "text": "reasoning...", "thought": true },
                    { "thoughtSignature": "late-signature-value" },
                    { "text": "answer" }
                ]
            }]
        });
        let req = parse_request("gemini-2.5-pro", &body).unwrap();
        match &req.messages[0].content[0] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some("late-signature-value"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn bare_signature_without_thinking_becomes_marker() {
        let body = json!({
            "contents": [{
                "role": "model",
                "parts": [{ "thoughtSignature": "orphan-signature" }]
            }]
        });
        let req = parse_request("gemini-2.5-pro", &body).unwrap();
        match &req.messages[0].content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
                ..
            } => {
                assert!(thinking.is_empty());
                assert_eq!(signature.as_deref(), Some("orphan-signature"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn function_call_and_response_pair_by_name() {
        let body = json!({
            "contents": [
                { "role": "model", "parts": [
                    { "functionCall": { "name": "read_file", "args": { "path": "/x" } } }
                ]},
                { "role": "user", "parts": [
                    { "functionResponse": { "name": "read_file", "response": { "output": "data" } } }
                ]}
            ]
        });
        let req = parse_request("gemini-2.5-pro", &body).unwrap();
        let call_id = match &req.messages[0].content[0] {
            ContentBlock::ToolUse { id, .. } => id.clone(),
            other => panic!("unexpected block: {other:?}"),
        };
        match &req.messages[1].content[0] {
            ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, &call_id),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn encode_puts_signature_on_function_calls() {
        let sig = "s".repeat(64);
        let req = ChatRequest {
            model: "gemini-2.5-pro".into(),
            system: None,
            messages: vec![Message::assistant(vec![
                ContentBlock::Thinking {
                    thinking: "thinking".into(),
                    signature: Some(sig.clone()),
                    redacted: false,
                },
                ContentBlock::ToolUse {
                    id: "call_x".into(),
                    name: "read_file".into(),
                    input: json!({"path": "/x"}),
                },
            ])],
            max_tokens: 1024,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: vec![],
            thinking_budget: Some(4096),
            tools: vec![],
        };
        let body = encode_request(&req);
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["thoughtSignature"], sig.as_str());
        assert_eq!(parts[1]["thoughtSignature"], sig.as_str());
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            4096
        );
    }

    #[test]
    fn tool_result_maps_back_to_function_response() {
        let req = ChatRequest {
            model: "gemini-2.5-pro".into(),
            system: None,
            messages: vec![
                Message::assistant(vec![ContentBlock::ToolUse {
                    id: "call_abc".into(),
                    name: "read_file".into(),
                    input: json!({"path": "/x"}),
                }]),
                Message::user(vec![ContentBlock::ToolResult {
                    tool_use_id: "call_abc".into(),
                    content: json!("file contents"),
                    is_error: false,
                }]),
            ],
            max_tokens: 1024,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: vec![],
            thinking_budget: None,
            tools: vec![],
        };
        let body = encode_request(&req);
        let part = &body["contents"][1]["parts"][0];
        assert_eq!(part["functionResponse"]["name"], "read_file");
        assert_eq!(part["functionResponse"]["response"]["output"], "file contents");
    }

    #[test]
    fn response_with_wrapper_envelope() {
        let body = json!({
            "response": {
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": "hi" }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 2 }
            }
        });
        let resp = parse_response("gemini-2.5-pro", &body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.input_tokens, 4);
        assert_eq!(resp.content, vec![ContentBlock::text("hi")]);
    }

    #[test]
    fn function_call_response_maps_to_tool_use_stop() {
        let body = json!({
            "candidates": [{
                "content": { "role": "model", "parts": [
                    { "functionCall": { "name": "t", "args": {} } }
                ]},
                "finishReason": "STOP"
            }]
        });
        let resp = parse_response("gemini-2.5-pro", &body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
    }
}
