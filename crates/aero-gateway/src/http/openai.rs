//! POST /v1/chat/completions — OpenAI chat-completions endpoint.

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
use aero_protocol::openai;

use crate::app::AppState;
use crate::auth::{authenticate, CallerIdentity};
use crate::pipeline::{self, StreamCollector};

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, headers, body, None).await
}

pub async fn chat_completions_for_backend(
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
        Err(reason) => {
            return error_response(StatusCode::UNAUTHORIZED, "authentication_error", reason)
        }
    };

    let request = match openai::parse_request(&body, state.config.compatibility_mode) {
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
        "chat completions request"
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
            let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
            let body = openai::encode_response(&resp, &id, chrono::Utc::now().timestamp());
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
    let mut collector = StreamCollector::new(state.clone(), caller.clone(), &prepared);
    let scid = prepared.scid.clone();
    let (first, mut active) =
        pipeline::start_stream(state, prepared.request.clone(), caller, pinned).await;

    let Some(first) = first else {
        let err = match active.handle.await {
            Ok(Err(e)) => e,
            _ => RouterError::ChainExhausted { failures: vec![] },
        };
        return router_error_response(&err);
    };

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut tool_index = 0u32;
        let mut role_sent = false;
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

            let mut delta = json!({});
            let mut finish_reason = Value::Null;
            let mut usage = Value::Null;
            let mut done = false;

            match &event {
                StreamEvent::MessageStart { .. } => {
                    if !role_sent {
                        role_sent = true;
                        delta = json!({ "role": "assistant", "content": "" });
                    }
                }
                StreamEvent::ThinkingDelta { text } => {
                    delta = json!({ "reasoning_content": text });
                }
                // No signature representation on this wire; the collector has
                // already cached it for recovery on the next turn.
                StreamEvent::SignatureCaptured { .. } => {}
                StreamEvent::TextDelta { text } => {
                    delta = json!({ "content": text });
                }
                StreamEvent::ToolUse { id: tool_id, name, input } => {
                    delta = json!({
                        "tool_calls": [{
                            "index": tool_index,
                            "id": collector.emit_tool_id(tool_id),
                            "type": "function",
                            "function": { "name": name, "arguments": input.to_string() },
                        }],
                    });
                    tool_index += 1;
                }
                StreamEvent::Finish { stop_reason, input_tokens, output_tokens, .. } => {
                    finish_reason = json!(stop_reason.as_openai());
                    usage = json!({
                        "prompt_tokens": input_tokens,
                        "completion_tokens": output_tokens,
                        "total_tokens": input_tokens + output_tokens,
                    });
                    done = true;
                }
                StreamEvent::Error { message } => {
                    let chunk = json!({ "error": { "message": message, "type": "api_error" } });
                    yield Ok::<_, std::convert::Infallible>(
                        Event::default().data(chunk.to_string()),
                    );
                    break;
                }
            }

            if delta.as_object().is_some_and(|o| !o.is_empty()) || !finish_reason.is_null() {
                let mut chunk = json!({
                    "id": id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": collector.model(),
                    "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
                });
                if !usage.is_null() {
                    chunk["usage"] = usage;
                }
                yield Ok(Event::default().data(chunk.to_string()));
            }

            if done {
                yield Ok(Event::default().data("[DONE]"));
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

    let resp = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    with_scid(resp, &scid)
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
            "error": { "message": message, "type": error_type },
        })),
    )
        .into_response()
}

fn router_error_response(err: &RouterError) -> Response {
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
            "service_unavailable",
            &err.failure_lines().join("; "),
        ),
    }
}
