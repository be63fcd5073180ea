//! Normalized request/response model shared by all dialect codecs.
//!
//! Content is always a list of typed blocks — the dialect codecs are the only
//! places that know about string-or-array polymorphism on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single typed content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Extended-reasoning block. The signature is an opaque token bound to
    /// (conversation, model, content) by the upstream; it is only valid when
    /// replayed into the same upstream session.
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        redacted: bool,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Image {
        media_type: String,
        /// Base64 payload, passed through untouched across translations.
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn is_thinking(&self) -> bool {
        matches!(self, ContentBlock::Thinking { .. })
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    /// Concatenated text of all plain text blocks.
    pub fn plain_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// True when every block is empty or whitespace-only text.
    pub fn is_effectively_empty(&self) -> bool {
        self.content.is_empty()
            || self.content.iter().all(|b| match b {
                ContentBlock::Text { text } => text.trim().is_empty(),
                _ => false,
            })
    }
}

/// Tool definition in the flat internal shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

/// Normalized request, dialect-independent.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
    /// `Some(budget)` when extended thinking is requested.
    pub thinking_budget: Option<u32>,
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    pub fn thinking_enabled(&self) -> bool {
        self.thinking_budget.is_some()
    }

    /// Last assistant message, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_assistant())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Normalized non-streaming response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Dialect-independent finish reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Safety,
    Other,
}

impl StopReason {
    pub fn as_anthropic(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
            StopReason::Safety => "end_turn",
            StopReason::Other => "end_turn",
        }
    }

    pub fn as_openai(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "stop",
            StopReason::MaxTokens => "length",
            StopReason::StopSequence => "stop",
            StopReason::ToolUse => "tool_calls",
            StopReason::Safety => "content_filter",
            StopReason::Other => "stop",
        }
    }

    pub fn as_gemini(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "STOP",
            StopReason::MaxTokens => "MAX_TOKENS",
            StopReason::StopSequence => "STOP",
            StopReason::ToolUse => "STOP",
            StopReason::Safety => "SAFETY",
            StopReason::Other => "OTHER",
        }
    }

    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            _ => StopReason::Other,
        }
    }

    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => StopReason::EndTurn,
            "length" => StopReason::MaxTokens,
            "tool_calls" | "function_call" => StopReason::ToolUse,
            "content_filter" => StopReason::Safety,
            _ => StopReason::Other,
        }
    }

    pub fn from_gemini(reason: &str) -> Self {
        match reason {
            "STOP" => StopReason::EndTurn,
            "MAX_TOKENS" => StopReason::MaxTokens,
            "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => StopReason::Safety,
            _ => StopReason::Other,
        }
    }
}

/// Placeholder inserted for messages some backends would reject as empty.
pub const EMPTY_MESSAGE_PLACEHOLDER: &str = "(empty)";

/// Deterministic tool-call id for streamed function calls:
/// `call_<sha256(name, args)[..24]>`.
pub fn tool_call_id(name: &str, args: &Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(args.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("call_{}", &digest[..24])
}

/// Tool names whose upstream schema is sometimes empty; a minimal query
/// schema is synthesized for them so strict backends accept the declaration.
pub const SCHEMALESS_TOOL_FALLBACKS: &[&str] = &["web_search", "google_search", "search"];

/// Minimal fallback schema for the tools above.
pub fn fallback_tool_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": { "query": { "type": "string" } },
        "required": ["query"]
    })
}

/// Apply the schema fallback where needed; other tools pass through.
pub fn normalize_tool_schema(tool: &ToolDefinition) -> Value {
    let empty = match &tool.input_schema {
        Value::Null => true,
        Value::Object(map) => {
            map.is_empty()
                || map
                    .get("properties")
                    .map(|p| p.as_object().is_none_or(|o| o.is_empty()))
                    .unwrap_or(true)
        }
        _ => false,
    };
    if empty && SCHEMALESS_TOOL_FALLBACKS.contains(&tool.name.as_str()) {
        fallback_tool_schema()
    } else if tool.input_schema.is_null() {
        serde_json::json!({ "type": "object", "properties": {} })
    } else {
        tool.input_schema.clone()
    }
}
