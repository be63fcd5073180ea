//! OpenAI chat-completions SSE stream parser.
//!
//! Chunks carry `choices[0].delta` fragments; tool-call arguments stream as
//! string pieces indexed by position and are only emitted once complete.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use aero_protocol::model::StopReason;

use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamEvent};

pub async fn process_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    use futures_util::StreamExt;

    let mut started = false;
    let mut tool_calls: Vec<PendingToolCall> = Vec::new();
    let mut input_tokens: u32 = 0;
    let mut output_tokens: u32 = 0;
    let mut stop_reason: Option<StopReason> = None;
    let mut lines = LineBuffer::default();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
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
            if data == "[DONE]" {
                break 'outer;
            }

            let Ok(chunk) = serde_json::from_str::<WireChunk>(&data) else {
                continue;
            };

            if !started {
                started = true;
                let _ = tx
                    .send(StreamEvent::MessageStart {
                        model: chunk.model.clone().unwrap_or_else(|| model.clone()),
                        input_tokens: 0,
                    })
                    .await;
            }

            if let Some(usage) = &chunk.usage {
                input_tokens = usage.prompt_tokens;
                output_tokens = usage.completion_tokens;
            }

            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };

            if let Some(reasoning) = choice.delta.reasoning_content {
                if !reasoning.is_empty()
                    && tx
                        .send(StreamEvent::ThinkingDelta { text: reasoning })
                        .await
                        .is_err()
                {
                    return;
                }
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty()
                    && tx.send(StreamEvent::TextDelta { text: content }).await.is_err()
                {
                    return;
                }
            }
            for fragment in choice.delta.tool_calls {
                let idx = fragment.index as usize;
                while tool_calls.len() <= idx {
                    tool_calls.push(PendingToolCall::default());
                }
                let pending = &mut tool_calls[idx];
                if let Some(id) = fragment.id {
                    pending.id = id;
                }
                if let Some(f) = fragment.function {
                    if let Some(name) = f.name {
                        pending.name = name;
                    }
                    if let Some(args) = f.arguments {
                        pending.arguments.push_str(&args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                stop_reason = Some(StopReason::from_openai(&reason));
            }
        }
    }

    // Tool calls flush once the stream settles; arguments may have spanned
    // many chunks.
    for pending in tool_calls.drain(..) {
        if pending.name.is_empty() {
            continue;
        }
        let input = serde_json::from_str(&pending.arguments)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let id = if pending.id.is_empty() {
            aero_protocol::model::tool_call_id(&pending.name, &input)
        } else {
            pending.id
        };
        if tx
            .send(StreamEvent::ToolUse {
                id,
                name: pending.name,
                input,
            })
            .await
            .is_err()
        {
            return;
        }
    }

    let synthesized = stop_reason.is_none();
    if synthesized {
        warn!("openai stream ended without a finish reason, synthesizing one");
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

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

// OpenAI SSE chunk types (private — deserialization only)

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCallFragment>,
}

#[derive(Deserialize)]
struct WireToolCallFragment {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionFragment>,
}

#[derive(Deserialize)]
struct WireFunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
