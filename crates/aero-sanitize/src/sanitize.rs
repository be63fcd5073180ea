//! Message sanitizer.
//!
//! Inbound histories arrive mangled in client-specific ways: signatures
//! stripped, thinking flattened to text, tool ids re-issued, tool calls left
//! unanswered. This pass rewrites the message list into a shape the upstream
//! validators accept, recovering signatures where a cache key still matches
//! and downgrading thinking to plain text where nothing can be proven.
//!
//! The fallback is always "drop to text, disable thinking" — a recovered
//! signature is only ever a best-effort guess, so content is preserved and
//! nothing is sent on hope alone.

use tracing::{debug, info};

use aero_cache::SignatureStore;
use aero_core::client::ClientType;
use aero_core::config::MIN_SIGNATURE_LEN;
use aero_protocol::model::{ContentBlock, Message};
use aero_protocol::thought_id;

use crate::fingerprint::session_fingerprint;

/// Everything the sanitizer consults besides the messages themselves. The
/// store handle is passed in — this module is the sole caller of the cache
/// on the request path.
pub struct SanitizeContext<'a> {
    pub store: &'a SignatureStore,
    pub client_type: ClientType,
    pub owner_id: Option<String>,
    /// `last_signature` from the conversation state, when an scid was given.
    pub conversation_signature: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Thinking blocks downgraded to plain text.
    pub thinking_downgraded: usize,
    /// Orphan tool blocks removed.
    pub tool_chains_fixed: usize,
    /// Thinking blocks that left with a recovered signature.
    pub signatures_recovered: usize,
    /// Which recovery layer produced the last recovered signature.
    pub recovery_layer: Option<&'static str>,
}

#[derive(Debug)]
pub struct SanitizeOutcome {
    pub messages: Vec<Message>,
    pub thinking_enabled: bool,
    pub report: SanitizeReport,
}

/// Sanitize a client-submitted message list.
///
/// Deterministic for identical inputs and cache state, and idempotent:
/// running the output through again changes nothing.
pub fn sanitize(
    messages: Vec<Message>,
    thinking_enabled: bool,
    ctx: &SanitizeContext<'_>,
) -> SanitizeOutcome {
    let mut report = SanitizeReport::default();
    let mut messages = messages;

    let session_fp = session_fingerprint(&messages);
    let latest_assistant = messages.iter().rposition(|m| m.is_assistant());

    // Historical assistant turns: signatures there are bound to a dead
    // upstream session and can only provoke rejections. Downgrade to text.
    // With thinking off, the latest turn gets the same treatment — the flag
    // must match the content.
    for (i, message) in messages.iter_mut().enumerate() {
        if message.is_assistant() && (Some(i) != latest_assistant || !thinking_enabled) {
            downgrade_thinking(message, &mut report);
        }
    }

    // Latest assistant turn: recover a signature per thinking block or
    // downgrade the block.
    let mut thinking_enabled = thinking_enabled;
    if thinking_enabled {
        if let Some(idx) = latest_assistant {
            let recovered_ok = recover_latest_assistant(
                &mut messages,
                idx,
                session_fp.as_deref(),
                ctx,
                &mut report,
            );
            if !recovered_ok {
                info!(
                    client = %ctx.client_type,
                    "no valid signature for latest assistant turn, disabling thinking"
                );
                thinking_enabled = false;
            }
        }
    }

    // Decode smuggled signatures out of tool ids so upstream sees the
    // original ids, then enforce use/result pairing.
    decode_tool_ids(&mut messages, ctx.client_type);
    fix_tool_chains(&mut messages, &mut report);

    if report.tool_chains_fixed > 0 {
        info!(tool_chains_fixed = report.tool_chains_fixed, "orphan tool blocks removed");
    }

    SanitizeOutcome {
        messages,
        thinking_enabled,
        report,
    }
}

/// Strip signatures and flatten thinking to text in one historical message.
/// Empty thinking blocks vanish entirely.
fn downgrade_thinking(message: &mut Message, report: &mut SanitizeReport) {
    let mut rewritten = Vec::with_capacity(message.content.len());
    for block in message.content.drain(..) {
        match block {
            ContentBlock::Thinking { thinking, .. } => {
                report.thinking_downgraded += 1;
                if !thinking.is_empty() {
                    rewritten.push(ContentBlock::Text { text: thinking });
                }
            }
            other => rewritten.push(other),
        }
    }
    message.content = rewritten;
}

/// Run the six-layer signature recovery over the latest assistant turn.
/// Returns true when every remaining thinking block carries a valid
/// signature (or there was nothing to recover).
fn recover_latest_assistant(
    messages: &mut [Message],
    idx: usize,
    session_fp: Option<&str>,
    ctx: &SanitizeContext<'_>,
    report: &mut SanitizeReport,
) -> bool {
    let owner = ctx.owner_id.as_deref();
    let policy = ctx.client_type.policy();

    // Tool-id derived candidates come from this same message.
    let encoded_signature = messages[idx].content.iter().find_map(|b| match b {
        ContentBlock::ToolUse { id, .. } => thought_id::decode(id).1,
        _ => None,
    });
    let adjacent_tool_ids: Vec<String> = messages[idx]
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(thought_id::decode(id).0),
            _ => None,
        })
        .collect();

    let mut all_signed = true;
    let mut rewritten: Vec<ContentBlock> = Vec::with_capacity(messages[idx].content.len());

    for block in messages[idx].content.clone() {
        match block {
            ContentBlock::Thinking {
                thinking,
                signature,
                redacted,
            } => {
                // Redacted markers round-trip untouched; their payload is the
                // signature itself.
                if redacted {
                    rewritten.push(ContentBlock::Thinking {
                        thinking,
                        signature,
                        redacted,
                    });
                    continue;
                }

                let recovered = recover_signature(
                    signature.as_deref(),
                    encoded_signature.as_deref(),
                    &adjacent_tool_ids,
                    session_fp,
                    owner,
                    policy.recent_window_secs,
                    ctx,
                );

                match recovered {
                    Some((sig, layer)) => {
                        debug!(layer, "thinking signature recovered");
                        report.signatures_recovered += 1;
                        report.recovery_layer = Some(layer);
                        rewritten.push(ContentBlock::Thinking {
                            thinking,
                            signature: Some(sig),
                            redacted: false,
                        });
                    }
                    None if thinking.is_empty() => {
                        // Unsigned empty marker carries nothing; drop it.
                        report.thinking_downgraded += 1;
                    }
                    None => {
                        all_signed = false;
                        report.thinking_downgraded += 1;
                        rewritten.push(ContentBlock::Text { text: thinking });
                    }
                }
            }
            other => rewritten.push(other),
        }
    }

    let has_thinking = rewritten.iter().any(ContentBlock::is_thinking);

    // The upstream invariant wants the signed thinking block first in the
    // final assistant turn.
    if has_thinking {
        rewritten.sort_by_key(|b| !b.is_thinking());
    } else {
        // No thinking block survived the client round-trip. A context or
        // tool-derived signature still proves the turn; re-anchor it as a
        // trailing-signature marker.
        let fallback = recover_signature(
            None,
            encoded_signature.as_deref(),
            &adjacent_tool_ids,
            session_fp,
            owner,
            policy.recent_window_secs,
            ctx,
        );
        match fallback {
            Some((sig, layer)) => {
                debug!(layer, "re-anchoring signature as empty thinking marker");
                report.signatures_recovered += 1;
                report.recovery_layer = Some(layer);
                rewritten.insert(
                    0,
                    ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: Some(sig),
                        redacted: false,
                    },
                );
            }
            None => all_signed = false,
        }
    }

    messages[idx].content = rewritten;
    all_signed
}

/// The six recovery layers, in order. Returns the signature with the name of
/// the layer that produced it.
fn recover_signature(
    client_signature: Option<&str>,
    encoded_signature: Option<&str>,
    adjacent_tool_ids: &[String],
    session_fp: Option<&str>,
    owner: Option<&str>,
    recent_window_secs: u64,
    ctx: &SanitizeContext<'_>,
) -> Option<(String, &'static str)> {
    // 1. The client-supplied signature, past the validity floor.
    if let Some(sig) = client_signature {
        if sig.len() >= MIN_SIGNATURE_LEN {
            return Some((sig.to_string(), "client"));
        }
    }

    // 2. The conversation state's last signature.
    if let Some(sig) = &ctx.conversation_signature {
        if sig.len() >= MIN_SIGNATURE_LEN {
            return Some((sig.clone(), "conversation"));
        }
    }

    // 3. A signature smuggled through an encoded tool id in this message.
    if let Some(sig) = encoded_signature {
        return Some((sig.to_string(), "encoded-id"));
    }

    // 4. The session fingerprint index.
    if let Some(fp) = session_fp {
        if let Some(sig) = ctx.store.get_by_session_fingerprint(fp, owner) {
            return Some((sig, "session-fingerprint"));
        }
    }

    // 5. The tool-id index for adjacent tool uses.
    for tool_id in adjacent_tool_ids {
        if let Some(sig) = ctx.store.get_by_tool_id(tool_id, owner) {
            return Some((sig, "tool-id"));
        }
    }

    // 6. Most recent entry for this owner, within the client's window.
    if let Some(sig) = ctx.store.get_recent(recent_window_secs, owner, None) {
        return Some((sig, "recent"));
    }

    None
}

/// Rewrite encoded tool ids back to their originals everywhere, so upstream
/// sees the ids it emitted. Applies to every client — an encoded id in the
/// history must never leak upstream even if this client did not produce it.
fn decode_tool_ids(messages: &mut [Message], _client_type: ClientType) {
    for message in messages.iter_mut() {
        for block in message.content.iter_mut() {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    let (decoded, _) = thought_id::decode(id);
                    *id = decoded;
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    let (decoded, _) = thought_id::decode(tool_use_id);
                    *tool_use_id = decoded;
                }
                _ => {}
            }
        }
    }
}

/// Enforce the pairing invariant: every tool_use in an assistant turn needs
/// exactly one tool_result before the next assistant turn, and every
/// tool_result needs its tool_use. Unpaired blocks are removed; a message
/// emptied by removal gets a placeholder text block.
fn fix_tool_chains(messages: &mut Vec<Message>, report: &mut SanitizeReport) {
    let len = messages.len();
    let mut orphan_uses: Vec<(usize, String)> = Vec::new();
    let mut valid_use_ids: Vec<String> = Vec::new();

    for i in 0..len {
        if !messages[i].is_assistant() {
            continue;
        }
        // Results for this turn live in the following messages, up to the
        // next assistant turn.
        let mut result_ids: Vec<String> = Vec::new();
        for following in messages.iter().skip(i + 1) {
            if following.is_assistant() {
                break;
            }
            for block in &following.content {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    result_ids.push(tool_use_id.clone());
                }
            }
        }

        for block in &messages[i].content {
            if let ContentBlock::ToolUse { id, .. } = block {
                if result_ids.iter().any(|r| r == id) {
                    valid_use_ids.push(id.clone());
                } else {
                    orphan_uses.push((i, id.clone()));
                }
            }
        }
    }

    // Remove orphan tool uses.
    for (idx, orphan_id) in &orphan_uses {
        debug!(id = %orphan_id, "removing orphan tool_use");
        report.tool_chains_fixed += 1;
        messages[*idx]
            .content
            .retain(|b| !matches!(b, ContentBlock::ToolUse { id, .. } if id == orphan_id));
    }

    // Remove results that no surviving tool use explains.
    for message in messages.iter_mut() {
        let before = message.content.len();
        message.content.retain(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => {
                valid_use_ids.iter().any(|v| v == tool_use_id)
            }
            _ => true,
        });
        report.tool_chains_fixed += before - message.content.len();
    }

    // A message emptied by filtering would be rejected upstream.
    for message in messages.iter_mut() {
        if message.content.is_empty() {
            message.content.push(ContentBlock::text(""));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_cache::PutKeys;
    use serde_json::json;

    fn store() -> SignatureStore {
        SignatureStore::in_memory(100)
    }

    fn ctx<'a>(store: &'a SignatureStore) -> SanitizeContext<'a> {
        SanitizeContext {
            store,
            client_type: ClientType::Cli,
            owner_id: Some("owner-a".to_string()),
            conversation_signature: None,
        }
    }

    fn user(text: &str) -> Message {
        Message::user(vec![ContentBlock::text(text)])
    }

    fn thinking(text: &str, signature: Option<&str>) -> ContentBlock {
        ContentBlock::Thinking {
            thinking: text.to_string(),
            signature: signature.map(String::from),
            redacted: false,
        }
    }

    fn sig() -> String {
        "s".repeat(120)
    }

    #[test]
    fn historical_thinking_is_downgraded() {
        let s = store();
        let messages = vec![
            user("q1"),
            Message::assistant(vec![thinking("old reasoning", Some(&sig())), ContentBlock::text("a1")]),
            user("q2"),
            Message::assistant(vec![ContentBlock::text("a2")]),
            user("q3"),
        ];
        let out = sanitize(messages, false, &ctx(&s));
        // The historical assistant turn holds only text now.
        assert_eq!(
            out.messages[1].content,
            vec![
                ContentBlock::text("old reasoning"),
                ContentBlock::text("a1")
            ]
        );
        assert_eq!(out.report.thinking_downgraded, 1);
    }

    #[test]
    fn latest_assistant_keeps_valid_client_signature() {
        let s = store();
        let signature = sig();
        let messages = vec![
            user("q"),
            Message::assistant(vec![thinking("reasoning", Some(&signature))]),
            user("continue"),
        ];
        let out = sanitize(messages, true, &ctx(&s));
        assert!(out.thinking_enabled);
        match &out.messages[1].content[0] {
            ContentBlock::Thinking { signature: slot, .. } => {
                assert_eq!(slot.as_deref(), Some(signature.as_str()));
            }
            other => panic!("unexpected block: {other:?}"),
        }
        assert_eq!(out.report.recovery_layer, Some("client"));
    }

    #[test]
    fn unsigned_thinking_downgrades_and_disables_flag() {
        let s = store();
        let messages = vec![
            user("q"),
            Message::assistant(vec![thinking("reasoning without proof", None)]),
            user("continue"),
        ];
        let out = sanitize(messages, true, &ctx(&s));
        assert!(!out.thinking_enabled);
        // Content preserved as plain text, never discarded.
        assert_eq!(
            out.messages[1].content,
            vec![ContentBlock::text("reasoning without proof")]
        );
    }

    #[test]
    fn recovery_via_conversation_signature() {
        let s = store();
        let mut context = ctx(&s);
        let signature = sig();
        context.conversation_signature = Some(signature.clone());
        let messages = vec![
            user("q"),
            Message::assistant(vec![thinking("reasoning", None)]),
            user("next"),
        ];
        let out = sanitize(messages, true, &context);
        assert!(out.thinking_enabled);
        assert_eq!(out.report.recovery_layer, Some("conversation"));
        match &out.messages[1].content[0] {
            ContentBlock::Thinking { signature: slot, .. } => {
                assert_eq!(slot.as_deref(), Some(signature.as_str()));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn recovery_via_encoded_tool_id_and_decode() {
        let s = store();
        let signature = sig();
        let encoded = aero_protocol::thought_id::encode("call_abc", Some(&signature));
        let messages = vec![
            user("read it"),
            Message::assistant(vec![
                thinking("deciding which file", None),
                ContentBlock::ToolUse {
                    id: encoded.clone(),
                    name: "read_file".into(),
                    input: json!({"path": "/x"}),
                },
            ]),
            Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: encoded,
                content: json!("data"),
                is_error: false,
            }]),
        ];
        let out = sanitize(messages, true, &ctx(&s));
        assert!(out.thinking_enabled);
        assert_eq!(out.report.recovery_layer, Some("encoded-id"));
        // Upstream sees the original id on both sides.
        match &out.messages[1].content[1] {
            ContentBlock::ToolUse { id, .. } => assert_eq!(id, "call_abc"),
            other => panic!("unexpected block: {other:?}"),
        }
        match &out.messages[2].content[0] {
            ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, "call_abc"),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn recovery_via_session_fingerprint() {
        let s = store();
        let signature = sig();
        let messages = vec![
            user("the opening question"),
            Message::assistant(vec![thinking("reasoning", None)]),
            user("next"),
        ];
        let fp = session_fingerprint(&messages).unwrap();
        s.put(
            &signature,
            PutKeys {
                session_fp: Some(fp),
                owner_id: Some("owner-a".to_string()),
                model_family: "claude".into(),
                ..PutKeys::default()
            },
        );
        let out = sanitize(messages, true, &ctx(&s));
        assert!(out.thinking_enabled);
        assert_eq!(out.report.recovery_layer, Some("session-fingerprint"));
    }

    #[test]
    fn recovery_via_adjacent_tool_id() {
        let s = store();
        let signature = sig();
        s.put(
            &signature,
            PutKeys {
                tool_id: Some("call_xyz".to_string()),
                owner_id: Some("owner-a".to_string()),
                model_family: "gemini".into(),
                ..PutKeys::default()
            },
        );
        let messages = vec![
            user("run it"),
            Message::assistant(vec![
                thinking("planning the call", None),
                ContentBlock::ToolUse {
                    id: "call_xyz".into(),
                    name: "run".into(),
                    input: json!({}),
                },
            ]),
            Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: "call_xyz".into(),
                content: json!("done"),
                is_error: false,
            }]),
        ];
        let out = sanitize(messages, true, &ctx(&s));
        assert!(out.thinking_enabled);
        assert_eq!(out.report.recovery_layer, Some("tool-id"));
    }

    #[test]
    fn recovery_via_recent_respects_owner() {
        let s = store();
        let signature = sig();
        s.put(
            &signature,
            PutKeys {
                owner_id: Some("owner-a".to_string()),
                model_family: "claude".into(),
                ..PutKeys::default()
            },
        );

        let messages = |text: &str| {
            vec![
                user(text),
                Message::assistant(vec![thinking("reasoning", None)]),
                user("next"),
            ]
        };

        // Same owner: the recency fallback saves the block.
        let out = sanitize(messages("mine"), true, &ctx(&s));
        assert!(out.thinking_enabled);
        assert_eq!(out.report.recovery_layer, Some("recent"));

        // Different owner: the entry is invisible, block downgrades, and the
        // request still proceeds (no error to the other tenant).
        let mut other = ctx(&s);
        other.owner_id = Some("owner-b".to_string());
        let out = sanitize(messages("theirs"), true, &other);
        assert!(!out.thinking_enabled);
        assert_eq!(out.report.recovery_layer, None);
    }

    #[test]
    fn orphan_tool_use_removed() {
        let s = store();
        let messages = vec![
            user("q"),
            Message::assistant(vec![
                ContentBlock::ToolUse {
                    id: "T1".into(),
                    name: "a".into(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "T2".into(),
                    name: "b".into(),
                    input: json!({}),
                },
            ]),
            Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: "T1".into(),
                content: json!("ok"),
                is_error: false,
            }]),
        ];
        let out = sanitize(messages, false, &ctx(&s));
        assert_eq!(out.report.tool_chains_fixed, 1);
        let uses: Vec<_> = out.messages[1]
            .content
            .iter()
            .filter(|b| b.is_tool_use())
            .collect();
        assert_eq!(uses.len(), 1);
    }

    #[test]
    fn dangling_tool_result_removed_and_message_padded() {
        let s = store();
        let messages = vec![
            user("q"),
            Message::assistant(vec![ContentBlock::text("no tools here")]),
            Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: "ghost".into(),
                content: json!("?"),
                is_error: false,
            }]),
        ];
        let out = sanitize(messages, false, &ctx(&s));
        assert_eq!(out.report.tool_chains_fixed, 1);
        // The emptied user message got a placeholder block.
        assert_eq!(out.messages[2].content.len(), 1);
        assert!(matches!(&out.messages[2].content[0], ContentBlock::Text { .. }));
    }

    #[test]
    fn results_do_not_pair_across_assistant_turns() {
        let s = store();
        let messages = vec![
            user("q"),
            Message::assistant(vec![ContentBlock::ToolUse {
                id: "T1".into(),
                name: "a".into(),
                input: json!({}),
            }]),
            Message::assistant(vec![ContentBlock::text("interrupted")]),
            Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: "T1".into(),
                content: json!("late"),
                is_error: false,
            }]),
        ];
        let out = sanitize(messages, false, &ctx(&s));
        // The use lost its (late) result and the result lost its use.
        assert_eq!(out.report.tool_chains_fixed, 2);
    }

    #[test]
    fn empty_thinking_with_signature_kept_as_marker() {
        let s = store();
        let signature = sig();
        let messages = vec![
            user("q"),
            Message::assistant(vec![thinking("", Some(&signature)), ContentBlock::text("a")]),
            user("next"),
        ];
        let out = sanitize(messages, true, &ctx(&s));
        assert!(out.thinking_enabled);
        match &out.messages[1].content[0] {
            ContentBlock::Thinking {
                thinking, signature: slot, ..
            } => {
                assert!(thinking.is_empty());
                assert_eq!(slot.as_deref(), Some(signature.as_str()));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn signed_thinking_moves_to_front() {
        let s = store();
        let signature = sig();
        let messages = vec![
            user("q"),
            Message::assistant(vec![
                ContentBlock::text("answer first"),
                thinking("reasoning", Some(&signature)),
            ]),
            user("next"),
        ];
        let out = sanitize(messages, true, &ctx(&s));
        assert!(out.messages[1].content[0].is_thinking());
    }

    #[test]
    fn missing_thinking_block_reanchored_from_conversation() {
        let s = store();
        let mut context = ctx(&s);
        let signature = sig();
        context.conversation_signature = Some(signature.clone());
        // The client flattened the assistant turn to text only.
        let messages = vec![
            user("q"),
            Message::assistant(vec![ContentBlock::text("previous answer")]),
            user("next"),
        ];
        let out = sanitize(messages, true, &context);
        assert!(out.thinking_enabled);
        match &out.messages[1].content[0] {
            ContentBlock::Thinking {
                thinking, signature: slot, ..
            } => {
                assert!(thinking.is_empty());
                assert_eq!(slot.as_deref(), Some(signature.as_str()));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn first_turn_keeps_thinking_enabled() {
        let s = store();
        let messages = vec![user("hello")];
        let out = sanitize(messages, true, &ctx(&s));
        assert!(out.thinking_enabled);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let s = store();
        let signature = sig();
        let encoded = aero_protocol::thought_id::encode("call_1", Some(&signature));
        let messages = vec![
            user("q1"),
            Message::assistant(vec![thinking("historic", Some(&signature))]),
            user("q2"),
            Message::assistant(vec![
                thinking("latest", Some(&signature)),
                ContentBlock::ToolUse {
                    id: encoded.clone(),
                    name: "t".into(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "orphan".into(),
                    name: "t2".into(),
                    input: json!({}),
                },
            ]),
            Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: encoded,
                content: json!("r"),
                is_error: false,
            }]),
        ];

        let first = sanitize(messages, true, &ctx(&s));
        let second = sanitize(first.messages.clone(), first.thinking_enabled, &ctx(&s));
        assert_eq!(first.messages, second.messages);
        assert_eq!(first.thinking_enabled, second.thinking_enabled);
        assert_eq!(second.report.tool_chains_fixed, 0);
        assert_eq!(second.report.thinking_downgraded, 0);
    }
}
