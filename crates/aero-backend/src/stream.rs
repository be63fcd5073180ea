//! Dialect-independent streaming events.

use serde_json::Value;

use aero_protocol::model::{ChatResponse, ContentBlock, StopReason};

/// Events emitted while translating an upstream response stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// First upstream frame: model identity and prompt token count.
    MessageStart { model: String, input_tokens: u32 },

    /// Incremental extended-reasoning text.
    ThinkingDelta { text: String },

    /// A thinking signature observed mid-stream. May arrive detached from
    /// any thought content; the consumer attaches it to the open thinking
    /// block and writes it into the signature store.
    SignatureCaptured { signature: String },

    /// Incremental visible text.
    TextDelta { text: String },

    /// A complete tool call (input JSON fully accumulated).
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Stream completed. `synthesized` marks a finish the translator had to
    /// invent because upstream closed without a finish reason.
    Finish {
        stop_reason: StopReason,
        input_tokens: u32,
        output_tokens: u32,
        synthesized: bool,
    },

    /// Mid-stream upstream failure, already stripped to a client-safe message.
    Error { message: String },
}

/// Reassembles complete lines out of network chunks. SSE frames routinely
/// split mid-line at chunk boundaries; the partial tail is carried until the
/// next chunk completes it.
#[derive(Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    /// Absorb one chunk and return every complete, non-empty line in it.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// Parse a single SSE line. Format: `event: <type>` / `data: <json>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
            .map(|data| SseParsed::Data(data.trim_start().to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Replay a complete response as the event sequence a stream would have
/// produced. Used by the non-streaming fallback path.
pub fn response_to_events(resp: &ChatResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for block in &resp.content {
        match block {
            ContentBlock::Text { text } => events.push(StreamEvent::TextDelta {
                text: text.clone(),
            }),
            ContentBlock::Thinking {
                thinking,
                signature,
                ..
            } => {
                if !thinking.is_empty() {
                    events.push(StreamEvent::ThinkingDelta {
                        text: thinking.clone(),
                    });
                }
                if let Some(sig) = signature {
                    events.push(StreamEvent::SignatureCaptured {
                        signature: sig.clone(),
                    });
                }
            }
            ContentBlock::ToolUse { id, name, input } => events.push(StreamEvent::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            ContentBlock::ToolResult { .. } | ContentBlock::Image { .. } => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        match parse_sse_line("event: message_start") {
            Some(SseParsed::Event(ev)) => assert_eq!(ev, "message_start"),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_sse_line("data: {\"x\":1}") {
            Some(SseParsed::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
        // Some upstreams omit the space after the colon.
        match parse_sse_line("data:{\"x\":1}") {
            Some(SseParsed::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_sse_line(": keepalive").is_none());
    }

    #[test]
    fn line_buffer_carries_partial_lines_across_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push("data: {\"par").is_empty());
        let lines = buf.push("tial\":1}\ndata: next\ndata: tail");
        assert_eq!(lines, vec!["data: {\"partial\":1}", "data: next"]);
        assert_eq!(buf.push("-end\n"), vec!["data: tail-end"]);
    }

    #[test]
    fn line_buffer_skips_blank_lines() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.push("\n\n  \ndata: x\n\n"), vec!["data: x"]);
    }
}
