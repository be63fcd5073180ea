//! POST /v1/messages — Anthropic messages endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use aero_backend::{RouterError, StreamEvent};
use aero_core::config::CONVERSATION_HEADER;
use aero_protocol::anthropic;

use crate::app::AppState;
use crate::auth::{authenticate, CallerIdentity};
use crate::pipeline::{self, StreamCollector};

pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, headers, body, None).await
}

pub async fn messages_for_backend(
    State(state): State<Arc<AppState>>,
    Path(backend): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, headers, body, Some(backend)).await
}

async fn handle(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Value,
    pinned: Option<String>,
) -> Response {
    let caller = match authenticate(&headers, state.config.server.api_password.as_deref()) {
        Ok(caller) => caller,
        Err(reason) => return error_response(StatusCode::UNAUTHORIZED, "authentication_error", reason),
    };

    let request = match anthropic::parse_request(&body, state.config.compatibility_mode) {
        Ok(req) => req,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &e.to_string(),
            )
        }
    };

    info!(
        model = %request.model,
        stream = request.stream,
        client = %caller.client_type,
        "anthropic messages request"
    );

    let prepared = pipeline::prepare(&state, request, &caller);

    if prepared.request.stream {
        handle_streaming(state, prepared, caller, pinned).await
    } else {
        handle_non_streaming(state, prepared, caller, pinned).await
    }
}

async fn handle_non_streaming(
    state: Arc<AppState>,
    prepared: pipeline::PreparedRequest,
    caller: CallerIdentity,
    pinned: Option<String>,
) -> Response {
    match pipeline::execute(&state, &prepared, &caller, pinned.as_deref()).await {
        Ok((resp, _)) => {
            let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
            let body = anthropic::encode_response(&resp, &id);
            with_scid(Json(body).into_response(), &prepared.scid)
        }
        Err(e) => router_error_response(&e),
    }
}

async fn handle_streaming(
    state: Arc<AppState>,
    prepared: pipeline::PreparedRequest,
    caller: CallerIdentity,
    pinned: Option<String>,
) -> Response {
    let collector = StreamCollector::new(state.clone(), caller.clone(), &prepared);
    let scid = prepared.scid.clone();
    let (first, mut active) =
        pipeline::start_stream(state, prepared.request.clone(), caller, pinned).await;

    let Some(first) = first else {
        // The chain failed before any byte was produced.
        let err = match active.handle.await {
            Ok(Err(e)) => e,
            _ => RouterError::ChainExhausted { failures: vec![] },
        };
        return router_error_response(&err);
    };

    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    let stream = async_stream::stream! {
        let mut emitter = SseEmitter::new(message_id, collector);
        let mut pending = Some(first);
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match active.rx.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            emitter.collector.absorb(&event);
            for frame in emitter.frames(&event) {
                yield Ok::<_, std::convert::Infallible>(frame);
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
        emitter.collector.finalize(outcome.as_ref());
    };

    let resp = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    with_scid(resp, &scid)
}

/// Downstream Anthropic SSE state machine: idle → thinking → text →
/// tool_use → finished, driven by upstream events.
struct SseEmitter {
    message_id: String,
    collector: StreamCollector,
    block_index: usize,
    open_block: OpenBlock,
    started: bool,
}

#[derive(PartialEq)]
enum OpenBlock {
    None,
    Thinking,
    Text,
}

impl SseEmitter {
    fn new(message_id: String, collector: StreamCollector) -> Self {
        Self {
            message_id,
            collector,
            block_index: 0,
            open_block: OpenBlock::None,
            started: false,
        }
    }

    fn frames(&mut self, event: &StreamEvent) -> Vec<Event> {
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(sse_event(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.collector.model(),
                        "content": [],
                        "stop_reason": Value::Null,
                        "usage": { "input_tokens": self.collector.input_tokens(), "output_tokens": 0 },
                    },
                }),
            ));
        }

        match event {
            StreamEvent::MessageStart { .. } => {}
            StreamEvent::ThinkingDelta { text } => {
                self.ensure_block(OpenBlock::Thinking, &mut out);
                out.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "thinking_delta", "thinking": text },
                    }),
                ));
            }
            StreamEvent::SignatureCaptured { signature } => {
                self.ensure_block(OpenBlock::Thinking, &mut out);
                out.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "signature_delta", "signature": signature },
                    }),
                ));
            }
            StreamEvent::TextDelta { text } => {
                self.ensure_block(OpenBlock::Text, &mut out);
                out.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "text_delta", "text": text },
                    }),
                ));
            }
            StreamEvent::ToolUse { id, name, input } => {
                self.close_block(&mut out);
                let emitted_id = self.collector.emit_tool_id(id);
                out.push(sse_event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": emitted_id,
                            "name": name,
                            "input": {},
                        },
                    }),
                ));
                out.push(sse_event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "input_json_delta", "partial_json": input.to_string() },
                    }),
                ));
                out.push(sse_event(
                    "content_block_stop",
                    json!({ "type": "content_block_stop", "index": self.block_index }),
                ));
                self.block_index += 1;
            }
            StreamEvent::Finish {
                stop_reason,
                output_tokens,
                ..
            } => {
                self.close_block(&mut out);
                out.push(sse_event(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": { "stop_reason": stop_reason.as_anthropic(), "stop_sequence": Value::Null },
                        "usage": { "output_tokens": output_tokens },
                    }),
                ));
                out.push(sse_event("message_stop", json!({ "type": "message_stop" })));
            }
            StreamEvent::Error { message } => {
                out.push(sse_event(
                    "error",
                    json!({
                        "type": "error",
                        "error": { "type": "api_error", "message": message },
                    }),
                ));
            }
        }
        out
    }

    /// Open the requested block kind, closing whatever was open.
    fn ensure_block(&mut self, kind: OpenBlock, out: &mut Vec<Event>) {
        if self.open_block == kind {
            return;
        }
        self.close_block(out);
        let content_block = match kind {
            OpenBlock::Thinking => json!({ "type": "thinking", "thinking": "" }),
            OpenBlock::Text => json!({ "type": "text", "text": "" }),
            OpenBlock::None => return,
        };
        out.push(sse_event(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block,
            }),
        ));
        self.open_block = kind;
    }

    fn close_block(&mut self, out: &mut Vec<Event>) {
        if self.open_block != OpenBlock::None {
            out.push(sse_event(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": self.block_index }),
            ));
            self.block_index += 1;
            self.open_block = OpenBlock::None;
        }
    }
}

fn sse_event(name: &str, data: Value) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(&data).unwrap_or_default())
}

fn with_scid(mut resp: Response, scid: &str) -> Response {
    if let Ok(value) = scid.parse() {
        resp.headers_mut().insert(CONVERSATION_HEADER, value);
    }
    resp
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "error",
            "error": { "type": error_type, "message": message },
        })),
    )
        .into_response()
}

pub(crate) fn router_error_response(err: &RouterError) -> Response {
    match err {
        RouterError::UnsupportedModel(model) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            &format!("no backend accepts model '{model}'"),
        ),
        RouterError::Client { status, message } => error_response(
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
            "invalid_request_error",
            message,
        ),
        RouterError::ChainExhausted { .. } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "overloaded_error",
            &err.failure_lines().join("; "),
        ),
    }
}
