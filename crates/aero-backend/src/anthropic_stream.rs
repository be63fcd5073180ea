//! Anthropic SSE stream parser.
//!
//! Every `data:` payload on this wire repeats its kind in a `type` field, so
//! the payloads deserialize straight into a tagged frame enum and the
//! `event:` lines can be ignored. A small parser folds frames into
//! `StreamEvent`s, accumulating tool-call input across `input_json_delta`
//! fragments and surfacing `signature_delta` frames the moment they arrive
//! so the consumer can cache the signature mid-stream.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use aero_protocol::model::StopReason;

use crate::stream::{parse_sse_line, LineBuffer, SseParsed, StreamEvent};

/// Parse an Anthropic streaming response and emit StreamEvents.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut lines = LineBuffer::default();
    let mut parser = Parser::default();
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
            for event in parser.accept(&data) {
                if tx.send(event).await.is_err() {
                    return; // client disconnected
                }
            }
        }
    }

    let _ = tx.send(parser.into_finish()).await;
}

/// Folds wire frames into stream events.
#[derive(Default)]
struct Parser {
    /// Tool call being assembled; input JSON streams in fragments and the
    /// ToolUse event only fires once the block closes.
    pending_tool: Option<PendingTool>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<StopReason>,
}

struct PendingTool {
    id: String,
    name: String,
    input_json: String,
}

impl Parser {
    /// Feed one `data:` payload. Unknown or malformed frames are skipped —
    /// upstreams add frame kinds without notice.
    fn accept(&mut self, data: &str) -> Vec<StreamEvent> {
        match serde_json::from_str::<Frame>(data) {
            Ok(frame) => self.on_frame(frame),
            Err(e) => {
                debug!(error = %e, "skipping unrecognized stream frame");
                Vec::new()
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Vec<StreamEvent> {
        match frame {
            Frame::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                vec![StreamEvent::MessageStart {
                    model: message.model,
                    input_tokens: message.usage.input_tokens,
                }]
            }

            Frame::ContentBlockStart { content_block } => {
                if let BlockOpen::ToolUse { id, name } = content_block {
                    self.pending_tool = Some(PendingTool {
                        id,
                        name,
                        input_json: String::new(),
                    });
                }
                Vec::new()
            }

            Frame::ContentBlockDelta { delta } => match delta {
                Delta::TextDelta { text } => vec![StreamEvent::TextDelta { text }],
                Delta::ThinkingDelta { thinking } => {
                    vec![StreamEvent::ThinkingDelta { text: thinking }]
                }
                Delta::SignatureDelta { signature } => {
                    debug!(len = signature.len(), "thinking signature captured");
                    vec![StreamEvent::SignatureCaptured { signature }]
                }
                Delta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = &mut self.pending_tool {
                        tool.input_json.push_str(&partial_json);
                    }
                    Vec::new()
                }
                Delta::Other => Vec::new(),
            },

            Frame::ContentBlockStop => match self.pending_tool.take() {
                Some(tool) => {
                    let input = serde_json::from_str(&tool.input_json)
                        .unwrap_or(serde_json::Value::Object(Default::default()));
                    vec![StreamEvent::ToolUse {
                        id: tool.id,
                        name: tool.name,
                        input,
                    }]
                }
                None => Vec::new(),
            },

            Frame::MessageDelta { delta, usage } => {
                self.output_tokens = usage.output_tokens;
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(StopReason::from_anthropic(&reason));
                }
                Vec::new()
            }

            Frame::Error { error } => {
                warn!(message = %error.message, "anthropic stream error frame");
                vec![StreamEvent::Error {
                    message: error.message,
                }]
            }

            Frame::MessageStop | Frame::Ping => Vec::new(),
        }
    }

    /// Terminal event for the stream, synthesizing a finish reason when the
    /// upstream never sent one.
    fn into_finish(self) -> StreamEvent {
        let synthesized = self.stop_reason.is_none();
        if synthesized {
            warn!("anthropic stream ended without a finish reason, synthesizing one");
        }
        StreamEvent::Finish {
            stop_reason: self.stop_reason.unwrap_or(StopReason::Other),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            synthesized,
        }
    }
}

// Wire frames (private — deserialization only)

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    MessageStart {
        message: MessageMeta,
    },
    ContentBlockStart {
        content_block: BlockOpen,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    ContentBlockStop,
    MessageDelta {
        delta: FinishMeta,
        usage: OutputUsage,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorBody,
    },
}

#[derive(Deserialize)]
struct MessageMeta {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

/// Opening metadata of a content block. Only tool_use carries fields the
/// parser needs; text and thinking blocks are implied by their deltas.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockOpen {
    Text,
    Thinking,
    RedactedThinking,
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct FinishMeta {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut Parser, payloads: &[&str]) -> Vec<StreamEvent> {
        payloads
            .iter()
            .flat_map(|data| parser.accept(data))
            .collect()
    }

    #[test]
    fn message_start_carries_model_and_usage() {
        let mut parser = Parser::default();
        let events = feed(
            &mut parser,
            &[r#"{"type":"message_start","message":{"model":"claude-x","usage":{"input_tokens":12}}}"#],
        );
        match &events[0] {
            StreamEvent::MessageStart {
                model,
                input_tokens,
            } => {
                assert_eq!(model, "claude-x");
                assert_eq!(*input_tokens, 12);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn thinking_then_signature_deltas() {
        let mut parser = Parser::default();
        let events = feed(
            &mut parser,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig-abcdef"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
            ],
        );
        assert!(matches!(&events[0], StreamEvent::ThinkingDelta { text } if text == "hmm"));
        assert!(
            matches!(&events[1], StreamEvent::SignatureCaptured { signature } if signature == "sig-abcdef")
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn tool_input_accumulates_until_block_stop() {
        let mut parser = Parser::default();
        let events = feed(
            &mut parser,
            &[
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"read_file","input":{}}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"/x\"}"}}"#,
                r#"{"type":"content_block_stop","index":1}"#,
            ],
        );
        match &events[0] {
            StreamEvent::ToolUse { id, name, input } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "read_file");
                assert_eq!(input["path"], "/x");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn message_delta_feeds_the_finish_event() {
        let mut parser = Parser::default();
        feed(
            &mut parser,
            &[r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#],
        );
        match parser.into_finish() {
            StreamEvent::Finish {
                stop_reason,
                output_tokens,
                synthesized,
                ..
            } => {
                assert_eq!(stop_reason, StopReason::ToolUse);
                assert_eq!(output_tokens, 42);
                assert!(!synthesized);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_finish_reason_is_synthesized() {
        let parser = Parser::default();
        match parser.into_finish() {
            StreamEvent::Finish {
                stop_reason,
                synthesized,
                ..
            } => {
                assert_eq!(stop_reason, StopReason::Other);
                assert!(synthesized);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_frames_surface_their_message() {
        let mut parser = Parser::default();
        let events = feed(
            &mut parser,
            &[r#"{"type":"error","error":{"type":"overloaded_error","message":"slow down"}}"#],
        );
        assert!(matches!(&events[0], StreamEvent::Error { message } if message == "slow down"));
    }

    #[test]
    fn unknown_frames_and_pings_are_ignored() {
        let mut parser = Parser::default();
        let events = feed(
            &mut parser,
            &[
                r#"{"type":"ping"}"#,
                r#"{"type":"future_frame_kind","payload":1}"#,
                "not json at all",
            ],
        );
        assert!(events.is_empty());
    }
}
