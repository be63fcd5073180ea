//! Cross-dialect translation laws: a message list survives a trip through
//! another dialect semantically intact, modulo the known lossiness of the
//! OpenAI boundary (no thinking signatures there).

use serde_json::json;

use aero_protocol::model::{ChatRequest, ContentBlock, Message, Role};
use aero_protocol::{anthropic, gemini, openai};

fn request_with(messages: Vec<Message>) -> ChatRequest {
    ChatRequest {
        model: "claude-sonnet-4".into(),
        system: Some("be concise".into()),
        messages,
        max_tokens: 2_048,
        stream: false,
        temperature: Some(0.7),
        top_p: None,
        stop_sequences: vec![],
        thinking_budget: Some(4_096),
        tools: vec![],
    }
}

fn tool_conversation() -> Vec<Message> {
    vec![
        Message::user(vec![ContentBlock::text("read the config file")]),
        Message::assistant(vec![
            ContentBlock::Thinking {
                thinking: "the user wants the config".into(),
                signature: Some("sig-".repeat(20)),
                redacted: false,
            },
            ContentBlock::ToolUse {
                id: "call_cfg".into(),
                name: "read_file".into(),
                input: json!({"path": "/etc/app.toml"}),
            },
        ]),
        Message::user(vec![ContentBlock::ToolResult {
            tool_use_id: "call_cfg".into(),
            content: json!("key = 1"),
            is_error: false,
        }]),
        Message::assistant(vec![ContentBlock::text("the config sets key to 1")]),
        Message::user(vec![ContentBlock::text("thanks")]),
    ]
}

/// Text content of a message list, for semantic comparison.
fn texts(messages: &[Message]) -> Vec<(Role, String)> {
    messages
        .iter()
        .map(|m| (m.role, m.plain_text()))
        .collect()
}

fn tool_uses(messages: &[Message]) -> Vec<(String, String)> {
    messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, .. } => Some((id.clone(), name.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn anthropic_round_trip_preserves_everything() {
    let request = request_with(tool_conversation());
    let wire = anthropic::encode_request(&request);
    let parsed = anthropic::parse_request(&wire, false).unwrap();

    assert_eq!(parsed.messages, request.messages);
    assert_eq!(parsed.system, request.system);
    assert_eq!(parsed.thinking_budget, request.thinking_budget);
    assert_eq!(parsed.max_tokens, request.max_tokens);
}

#[test]
fn openai_round_trip_preserves_text_and_tools() {
    let request = request_with(tool_conversation());
    let wire = openai::encode_request(&request);
    let parsed = openai::parse_request(&wire, false).unwrap();

    assert_eq!(texts(&parsed.messages), texts(&request.messages));
    assert_eq!(tool_uses(&parsed.messages), tool_uses(&request.messages));

    // Known lossiness: reasoning text survives, the signature cannot.
    let thinking: Vec<_> = parsed
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::Thinking {
                thinking,
                signature,
                ..
            } => Some((thinking.clone(), signature.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(thinking.len(), 1);
    assert_eq!(thinking[0].0, "the user wants the config");
    assert_eq!(thinking[0].1, None);
}

#[test]
fn gemini_round_trip_preserves_thinking_and_pairs_tools() {
    let request = request_with(tool_conversation());
    let wire = gemini::encode_request(&request);
    let parsed = gemini::parse_request(&request.model, &wire).unwrap();

    assert_eq!(texts(&parsed.messages), texts(&request.messages));

    // Signatures ride thought parts on this wire.
    let signature = parsed.messages.iter().find_map(|m| {
        m.content.iter().find_map(|b| match b {
            ContentBlock::Thinking {
                signature: Some(sig),
                ..
            } => Some(sig.clone()),
            _ => None,
        })
    });
    assert_eq!(signature.as_deref(), Some("sig-".repeat(20).as_str()));

    // The functionCall part repeats the turn signature; that repeat must not
    // materialize as an extra thinking block.
    let thinking_blocks = parsed
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter(|b| matches!(b, ContentBlock::Thinking { .. }))
        .count();
    assert_eq!(thinking_blocks, 1);

    // Function calls have no wire ids; the minted ids still pair each
    // tool_use with its tool_result.
    let uses = tool_uses(&parsed.messages);
    assert_eq!(uses.len(), 1);
    let result_ids: Vec<String> = parsed
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(result_ids, vec![uses[0].0.clone()]);
}

#[test]
fn openai_to_anthropic_and_back_is_stable() {
    // OpenAI -> internal -> Anthropic -> internal -> OpenAI: the second and
    // third OpenAI bodies must agree (translation reaches a fixed point).
    let original = json!({
        "model": "gpt-4o",
        "max_tokens": 512,
        "messages": [
            { "role": "system", "content": "be brief" },
            { "role": "user", "content": "list files" },
            { "role": "assistant", "tool_calls": [
                { "id": "call_ls", "type": "function",
                  "function": { "name": "ls", "arguments": "{\"dir\":\"/\"}" } }
            ]},
            { "role": "tool", "tool_call_id": "call_ls", "content": "bin etc usr" },
            { "role": "assistant", "content": "three entries" }
        ]
    });

    let internal_1 = openai::parse_request(&original, false).unwrap();
    let anthropic_wire = anthropic::encode_request(&internal_1);
    let internal_2 = anthropic::parse_request(&anthropic_wire, false).unwrap();
    let openai_wire_2 = openai::encode_request(&internal_2);
    let internal_3 = openai::parse_request(&openai_wire_2, false).unwrap();
    let openai_wire_3 = openai::encode_request(&internal_3);

    assert_eq!(openai_wire_2, openai_wire_3);
    assert_eq!(texts(&internal_2.messages), texts(&internal_1.messages));
    assert_eq!(tool_uses(&internal_2.messages), tool_uses(&internal_1.messages));
}

#[test]
fn empty_user_turn_is_padded_in_every_dialect() {
    let request = request_with(vec![Message::user(vec![ContentBlock::text("  ")])]);

    let anthropic_wire = anthropic::encode_request(&request);
    assert_eq!(
        anthropic_wire["messages"][0]["content"][0]["text"],
        "(empty)"
    );

    let openai_wire = openai::encode_request(&request);
    assert_eq!(openai_wire["messages"][1]["content"], "(empty)");

    let gemini_wire = gemini::encode_request(&request);
    assert_eq!(gemini_wire["contents"][0]["parts"][0]["text"], "(empty)");
}

#[test]
fn image_payloads_are_not_reencoded() {
    let payload = "iVBORw0KGgoAAAANSUhEUg==";
    let request = request_with(vec![Message::user(vec![
        ContentBlock::text("what is this"),
        ContentBlock::Image {
            media_type: "image/png".into(),
            data: payload.into(),
        },
    ])]);

    let anthropic_wire = anthropic::encode_request(&request);
    assert_eq!(
        anthropic_wire["messages"][0]["content"][1]["source"]["data"],
        payload
    );
    let parsed = anthropic::parse_request(&anthropic_wire, false).unwrap();

    let gemini_wire = gemini::encode_request(&parsed);
    assert_eq!(
        gemini_wire["contents"][0]["parts"][1]["inlineData"]["data"],
        payload
    );

    let openai_wire = openai::encode_request(&parsed);
    let url = openai_wire["messages"][1]["content"][1]["image_url"]["url"]
        .as_str()
        .unwrap();
    assert!(url.ends_with(payload));
}
