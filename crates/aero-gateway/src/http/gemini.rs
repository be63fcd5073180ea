//! POST /v1/models/{model}:generateContent and :streamGenerateContent —
//! Gemini-native endpoints. The model and method share one path segment.

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
use aero_protocol::gemini;

use crate::app::AppState;
use crate::auth::{authenticate, CallerIdentity};
use crate::pipeline::{self, StreamCollector};

pub async fn generate_content(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, model_action, headers, body, None).await
}

pub async fn generate_content_for_backend(
    State(state): State<Arc<AppState>>,
    Path((backend, model_action)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, model_action, headers, body, Some(backend)).await
}

async fn handle(
    state: Arc<AppState>,
    model_action: String,
    headers: HeaderMap,
    body: Value,
    pinned: Option<String>,
) -> Response {
    let caller = match authenticate(&headers, state.config.server.api_password.as_deref()) {
        Ok(caller) => caller,
        Err(reason) => return error_response(StatusCode::UNAUTHORIZED, reason),
    };

    let Some((model, method)) = model_action.split_once(':') else {
        return error_response(
            StatusCode::NOT_FOUND,
            "path must be /v1/models/{model}:generateContent",
        );
    };
    let streaming = match method {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return error_response(StatusCode::NOT_FOUND, &format!("unknown method '{other}'"))
        }
    };

    let mut request = match gemini::parse_request(model, &body) {
        Ok(req) => req,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    request.stream = streaming;

    info!(
        model = %request.model,
        stream = streaming,
        client = %caller.client_type,
        "gemini generate request"
    );

    let prepared = pipeline::prepare(&state, request, &caller);

    if streaming {
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
            let body = gemini::encode_response(&resp);
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

            let frame = match &event {
                StreamEvent::MessageStart { .. } => None,
                StreamEvent::ThinkingDelta { text } => Some(candidate_frame(
                    collector.model(),
                    json!([{ "text": text, "thought": true }]),
                    None,
                    None,
                )),
                // Mirror the upstream shape: the signature rides a standalone
                // part attached to the open thought.
                StreamEvent::SignatureCaptured { signature } => Some(candidate_frame(
                    collector.model(),
                    json!([{ "thought": true, "thoughtSignature": signature }]),
                    None,
                    None,
                )),
                StreamEvent::TextDelta { text } => Some(candidate_frame(
                    collector.model(),
                    json!([{ "text": text }]),
                    None,
                    None,
                )),
                StreamEvent::ToolUse { name, input, .. } => {
                    let mut part = json!({ "functionCall": { "name": name, "args": input } });
                    if let Some(sig) = collector.signature() {
                        part["thoughtSignature"] = json!(sig);
                    }
                    Some(candidate_frame(collector.model(), json!([part]), None, None))
                }
                StreamEvent::Finish { stop_reason, input_tokens, output_tokens, .. } => {
                    Some(candidate_frame(
                        collector.model(),
                        json!([]),
                        Some(stop_reason.as_gemini()),
                        Some(json!({
                            "promptTokenCount": input_tokens,
                            "candidatesTokenCount": output_tokens,
                            "totalTokenCount": input_tokens + output_tokens,
                        })),
                    ))
                }
                StreamEvent::Error { message } => Some(json!({
                    "error": { "code": 502, "status": "UNAVAILABLE", "message": message },
                })),
            };

            if let Some(frame) = frame {
                yield Ok::<_, std::convert::Infallible>(
                    Event::default().data(frame.to_string()),
                );
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

    let resp = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    with_scid(resp, &scid)
}

fn candidate_frame(
    model: &str,
    parts: Value,
    finish_reason: Option<&str>,
    usage: Option<Value>,
) -> Value {
    let mut candidate = json!({
        "content": { "role": "model", "parts": parts },
        "index": 0,
    });
    if let Some(reason) = finish_reason {
        candidate["finishReason"] = json!(reason);
    }
    let mut frame = json!({
        "candidates": [candidate],
        "modelVersion": model,
    });
    if let Some(usage) = usage {
        frame["usageMetadata"] = usage;
    }
    frame
}

fn with_scid(mut resp: Response, scid: &str) -> Response {
    if let Ok(value) = scid.parse() {
        resp.headers_mut().insert(CONVERSATION_HEADER, value);
    }
    resp
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": status.canonical_reason().unwrap_or("ERROR"),
            },
        })),
    )
        .into_response()
}

fn router_error_response(err: &RouterError) -> Response {
    match err {
        RouterError::UnsupportedModel(model) => error_response(
            StatusCode::BAD_REQUEST,
            &format!("no backend accepts model '{model}'"),
        ),
        RouterError::Client { status, message } => error_response(
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
            message,
        ),
        RouterError::ChainExhausted { .. } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &err.failure_lines().join("; "),
        ),
    }
}
