//! Gemini streamGenerateContent SSE parser.
//!
//! Each data frame is a partial GenerateContentResponse. Thought parts carry
//! `thought: true`; the thought signature is sometimes delivered as a bare
//! part with neither text nor the thought flag, which still has to reach the
//! consumer — that frame shape is observed upstream behavior, not an error.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use aero_protocol::model::{tool_call_id, StopReason};

use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamEvent};

pub async fn process_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    use futures_util::StreamExt;

    let mut started = false;
    let mut input_tokens: u32 = 0;
    let mut output_tokens: u32 = 0;
    let mut stop_reason: Option<StopReason> = None;
    let mut saw_tool_use = false;
    let mut lines = LineBuffer::default();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        for line in lines.push(text) {
            let Some(SseParsed::Data(data)) = parse_sse_line(&line) else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<Value>(&data) else {
                continue;
            };
            // Some deployments wrap each frame in a `response` envelope.
            let frame = frame.get("response").cloned().unwrap_or(frame);

            if !started {
                started = true;
                if tx
                    .send(StreamEvent::MessageStart {
                        model: model.clone(),
                        input_tokens: 0,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }

            if let Some(usage) = frame.get("usageMetadata") {
                input_tokens = usage
                    .get("promptTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(input_tokens as u64) as u32;
                output_tokens = usage
                    .get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(output_tokens as u64) as u32;
            }

            let Some(candidate) = frame.pointer("/candidates/0") else {
                continue;
            };

            if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
                for part in parts {
                    for event in part_events(part, &mut saw_tool_use) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }

            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                let mapped = StopReason::from_gemini(reason);
                stop_reason = Some(if mapped == StopReason::EndTurn && saw_tool_use {
                    StopReason::ToolUse
                } else {
                    mapped
                });
            }
        }
    }

    let synthesized = stop_reason.is_none();
    if synthesized {
        warn!("gemini stream ended without a finish reason, synthesizing one");
    }
    let _ = tx
        .send(StreamEvent::Finish {
            stop_reason: stop_reason.unwrap_or(StopReason::Other),
            input_tokens,
            output_tokens,
            synthesized,
        })
        .await;
}

/// Translate one response part into stream events.
fn part_events(part: &Value, saw_tool_use: &mut bool) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    let signature = part
        .get("thoughtSignature")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());

    if let Some(call) = part.get("functionCall") {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = call
            .get("args")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        // Signature first so the consumer can encode it into the call id.
        if let Some(sig) = signature {
            events.push(StreamEvent::SignatureCaptured {
                signature: sig.to_string(),
            });
        }
        *saw_tool_use = true;
        events.push(StreamEvent::ToolUse {
            id: tool_call_id(&name, &args),
            name,
            input: args,
        });
        return events;
    }

    let is_thought = part
        .get("thought")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = part.get("text").and_then(Value::as_str).unwrap_or_default();

    if is_thought {
        if !text.is_empty() {
            events.push(StreamEvent::ThinkingDelta {
                text: text.to_string(),
            });
        }
        if let Some(sig) = signature {
            events.push(StreamEvent::SignatureCaptured {
                signature: sig.to_string(),
            });
        }
    } else {
        // A bare signature part (no thought flag) attaches to whatever
        // thinking block is currently open downstream.
        if let Some(sig) = signature {
            events.push(StreamEvent::SignatureCaptured {
                signature: sig.to_string(),
            });
        }
        if !text.is_empty() {
            events.push(StreamEvent::TextDelta {
                text: text.to_string(),
            });
        }
    }

    events
}
