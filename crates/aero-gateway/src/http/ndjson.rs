//! POST /v1/chat-stream — NDJSON streaming endpoint for the IDE extension.
//!
//! Both directions are newline-delimited JSON nodes tagged by a small
//! integer. Request side: a checkpoint node (6) names the conversation and
//! model, text nodes (0) carry the user turn, tool-result nodes (1) answer
//! earlier tool-use nodes. Response side: 0 raw text, 2 main-text-finished,
//! 3 image-id, 4 safety, 5 tool-use, 6 checkpoint.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::{info, warn};

use aero_backend::StreamEvent;
use aero_core::client::ClientType;
use aero_core::config::CONVERSATION_HEADER;
use aero_protocol::model::{ChatRequest, ContentBlock, Message, StopReason};

use crate::app::AppState;
use crate::auth::authenticate;
use crate::pipeline::{self, StreamCollector};

/// Request-side node tags.
const NODE_TEXT: u64 = 0;
const NODE_TOOL_RESULT: u64 = 1;
const NODE_MAIN_TEXT_FINISHED: u64 = 2;
const NODE_SAFETY: u64 = 4;
const NODE_TOOL_USE: u64 = 5;
const NODE_CHECKPOINT: u64 = 6;

pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let mut caller = match authenticate(&headers, state.config.server.api_password.as_deref()) {
        Ok(caller) => caller,
        Err(reason) => return error_line(StatusCode::UNAUTHORIZED, reason),
    };
    // This endpoint exists for exactly one client shape.
    caller.client_type = ClientType::NdjsonIde;

    let parsed = match parse_request_nodes(&body) {
        Ok(parsed) => parsed,
        Err(reason) => return error_line(StatusCode::BAD_REQUEST, &reason),
    };
    if let Some(scid) = parsed.checkpoint_id.clone() {
        caller.scid = Some(scid);
    }

    info!(
        model = %parsed.request.model,
        client = %caller.client_type,
        "ndjson chat-stream request"
    );

    let prepared = pipeline::prepare(&state, parsed.request, &caller);
    let scid = prepared.scid.clone();
    let mut collector = StreamCollector::new(state.clone(), caller.clone(), &prepared);

    let (first, mut active) =
        pipeline::start_stream(state, prepared.request.clone(), caller, None).await;

    let Some(first) = first else {
        let reason = match active.handle.await {
            Ok(Err(e)) => e.failure_lines().join("; "),
            _ => "all backends exhausted".to_string(),
        };
        return error_line(StatusCode::SERVICE_UNAVAILABLE, &reason);
    };

    let stream = async_stream::stream! {
        let mut pending = Some(first);
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match active.rx.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            collector.absorb(&event);

            let mut nodes: Vec<Value> = Vec::new();
            match &event {
                // Thinking is not surfaced on this protocol; the signature
                // lifecycle is handled entirely by the collector.
                StreamEvent::MessageStart { .. }
                | StreamEvent::ThinkingDelta { .. }
                | StreamEvent::SignatureCaptured { .. } => {}
                StreamEvent::TextDelta { text } => {
                    nodes.push(json!({ "type": NODE_TEXT, "text": text }));
                }
                StreamEvent::ToolUse { id, name, input } => {
                    nodes.push(json!({
                        "type": NODE_TOOL_USE,
                        "tool_use": {
                            "id": collector.emit_tool_id(id),
                            "name": name,
                            "input": input,
                        },
                    }));
                }
                StreamEvent::Finish { stop_reason, .. } => {
                    if *stop_reason == StopReason::Safety {
                        nodes.push(json!({ "type": NODE_SAFETY, "reason": "blocked" }));
                    }
                    nodes.push(json!({ "type": NODE_MAIN_TEXT_FINISHED }));
                    nodes.push(json!({ "type": NODE_CHECKPOINT, "checkpoint_id": scid }));
                }
                StreamEvent::Error { message } => {
                    nodes.push(json!({ "type": NODE_SAFETY, "reason": message }));
                    nodes.push(json!({ "type": NODE_MAIN_TEXT_FINISHED }));
                }
            }

            for node in nodes {
                yield Ok::<_, std::convert::Infallible>(Bytes::from(format!("{node}\n")));
            }
            if matches!(event, StreamEvent::Finish { .. } | StreamEvent::Error { .. }) {
                break;
            }
        }

        let outcome = match active.handle.await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!(error = %e, "stream route failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "stream task panicked");
                None
            }
        };
        collector.finalize(outcome.as_ref());
    };

    let scid_header = prepared.scid.clone();
    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    if let Ok(value) = scid_header.parse() {
        resp.headers_mut().insert(CONVERSATION_HEADER, value);
    }
    resp
}

struct ParsedNodes {
    request: ChatRequest,
    checkpoint_id: Option<String>,
}

/// Decode the request-side NDJSON nodes into one internal request. History
/// comes from the authoritative record; the client only sends its new turn.
fn parse_request_nodes(body: &str) -> Result<ParsedNodes, String> {
    let mut model: Option<String> = None;
    let mut system: Option<String> = None;
    let mut checkpoint_id: Option<String> = None;
    let mut thinking_budget: Option<u32> = None;
    let mut max_tokens: u32 = 8_192;
    let mut text = String::new();
    let mut tool_results: Vec<ContentBlock> = Vec::new();

    for (lineno, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let node: Value =
            serde_json::from_str(line).map_err(|e| format!("line {}: {e}", lineno + 1))?;
        match node.get("type").and_then(Value::as_u64) {
            Some(NODE_CHECKPOINT) => {
                checkpoint_id = node
                    .get("checkpoint_id")
                    .and_then(Value::as_str)
                    .map(String::from);
                model = node.get("model").and_then(Value::as_str).map(String::from);
                system = node
                    .get("system")
                    .and_then(Value::as_str)
                    .map(String::from);
                thinking_budget = node
                    .get("thinking_budget")
                    .and_then(Value::as_u64)
                    .map(|b| b as u32);
                if let Some(m) = node.get("max_tokens").and_then(Value::as_u64) {
                    max_tokens = m as u32;
                }
            }
            Some(NODE_TEXT) => {
                if let Some(t) = node.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some(NODE_TOOL_RESULT) => {
                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: node
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    content: node.get("content").cloned().unwrap_or(Value::Null),
                    is_error: node
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                });
            }
            Some(other) => return Err(format!("line {}: unknown node type {other}", lineno + 1)),
            None => return Err(format!("line {}: node without type", lineno + 1)),
        }
    }

    let model = model.ok_or("checkpoint node (type 6) with a model is required")?;

    let mut content = tool_results;
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    if content.is_empty() {
        return Err("no user content in request".to_string());
    }

    Ok(ParsedNodes {
        request: ChatRequest {
            model,
            system,
            messages: vec![Message::user(content)],
            max_tokens,
            stream: true,
            temperature: None,
            top_p: None,
            stop_sequences: vec![],
            thinking_budget,
            tools: vec![],
        },
        checkpoint_id,
    })
}

fn error_line(status: StatusCode, message: &str) -> Response {
    let node = json!({ "type": NODE_SAFETY, "reason": message });
    (
        status,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        format!("{node}\n"),
    )
        .into_response()
}
