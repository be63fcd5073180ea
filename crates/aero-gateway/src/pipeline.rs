//! Per-request orchestration: classify → merge → sanitize → route → write
//! back. The sanitizer owns all cache reads on the way in; this module owns
//! the cache writes on the way out, driven by stream events.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use aero_backend::{RouteOutcome, RouterError, StreamEvent};
use aero_cache::PutKeys;
use aero_protocol::model::{ChatRequest, ChatResponse, ContentBlock, Message, StopReason};
use aero_protocol::{budget, thought_id};
use aero_sanitize::{sanitize, session_fingerprint, SanitizeContext, SanitizeReport};

use crate::app::AppState;
use crate::auth::CallerIdentity;

/// A request after merge, sanitization, and budget adjustment.
pub struct PreparedRequest {
    pub request: ChatRequest,
    pub scid: String,
    pub report: SanitizeReport,
    pub session_fp: Option<String>,
}

/// Merge client history with the authoritative record, sanitize, and clamp
/// the thinking budget.
pub fn prepare(
    state: &AppState,
    mut request: ChatRequest,
    caller: &CallerIdentity,
) -> PreparedRequest {
    let policy = caller.client_type.policy();

    let (scid, handle) = state
        .conversations
        .get_or_create(caller.scid.as_deref(), &caller.client_type.to_string());

    // The scid mutex serializes the merge; requests on one conversation are
    // processed in receipt order.
    let (merged, conversation_signature) = {
        let conversation = handle.lock().unwrap();
        let merged = aero_state::ConversationManager::merge_with_client_history(
            &conversation,
            &request.messages,
            policy.supports_id_encoding,
        );
        (merged, conversation.last_signature.clone())
    };
    request.messages = merged;

    let session_fp = session_fingerprint(&request.messages);

    let mut report = SanitizeReport::default();
    if policy.needs_sanitization {
        let outcome = sanitize(
            std::mem::take(&mut request.messages),
            request.thinking_enabled(),
            &SanitizeContext {
                store: &state.store,
                client_type: caller.client_type,
                owner_id: Some(caller.owner_id.clone()),
                conversation_signature,
            },
        );
        request.messages = outcome.messages;
        if !outcome.thinking_enabled {
            request.thinking_budget = None;
        }
        report = outcome.report;
    }

    if let Some(requested) = request.thinking_budget {
        let adjusted = budget::adjust(request.max_tokens, requested);
        request.max_tokens = adjusted.max_tokens;
        request.thinking_budget = Some(adjusted.thinking_budget);
    }

    debug!(
        scid = %scid,
        client = %caller.client_type,
        thinking = request.thinking_enabled(),
        downgraded = report.thinking_downgraded,
        tool_chains_fixed = report.tool_chains_fixed,
        "request prepared"
    );

    PreparedRequest {
        request,
        scid,
        report,
        session_fp,
    }
}

/// Non-streaming execution with anti-truncation retries and full writeback.
pub async fn execute(
    state: &AppState,
    prepared: &PreparedRequest,
    caller: &CallerIdentity,
    pinned: Option<&str>,
) -> Result<(ChatResponse, RouteOutcome), RouterError> {
    let policy = caller.client_type.policy();
    let attempts = 1 + state.config.retry.anti_truncation_max_attempts;

    let run = async {
        let mut attempt = 0;
        loop {
            let (resp, outcome) = state
                .router
                .send(&prepared.request, &policy, &caller.forward_headers, pinned)
                .await?;
            attempt += 1;
            if resp.stop_reason != StopReason::Other || attempt >= attempts {
                return Ok((resp, outcome));
            }
            warn!(attempt, "response looked truncated, retrying");
        }
    };

    // The optional global deadline bounds the entire chain-retry loop.
    let (mut resp, outcome) = match state.config.retry.request_deadline_secs {
        Some(secs) => {
            match tokio::time::timeout(std::time::Duration::from_secs(secs), run).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(RouterError::ChainExhausted {
                        failures: vec![aero_backend::BackendFailure {
                            backend: "gateway".to_string(),
                            class: aero_backend::FailureClass::TransientUpstream,
                            message: format!("request deadline of {secs}s exceeded"),
                        }],
                    })
                }
            }
        }
        None => run.await?,
    };

    write_back_response(state, prepared, caller, &resp, &outcome);

    // Smuggle captured signatures through tool ids for clients that keep
    // them intact.
    if policy.supports_id_encoding {
        let signature = response_signature(&resp.content);
        if let Some(sig) = signature {
            for block in resp.content.iter_mut() {
                if let ContentBlock::ToolUse { id, .. } = block {
                    *id = thought_id::encode(id, Some(&sig));
                }
            }
        }
    }

    Ok((resp, outcome))
}

/// First signature found in a response's thinking blocks.
fn response_signature(content: &[ContentBlock]) -> Option<String> {
    content.iter().find_map(|b| match b {
        ContentBlock::Thinking {
            signature: Some(sig),
            ..
        } => Some(sig.clone()),
        _ => None,
    })
}

/// Cache signatures, commit the turn, and record usage for a complete
/// non-streaming response.
fn write_back_response(
    state: &AppState,
    prepared: &PreparedRequest,
    caller: &CallerIdentity,
    resp: &ChatResponse,
    outcome: &RouteOutcome,
) {
    let policy = caller.client_type.policy();
    let family = aero_backend::router::model_family(&outcome.model).to_string();

    let mut last_signature: Option<String> = None;
    for block in &resp.content {
        match block {
            ContentBlock::Thinking {
                thinking,
                signature: Some(sig),
                ..
            } => {
                state.store.put(
                    sig,
                    PutKeys {
                        content: (!thinking.is_empty()).then(|| thinking.clone()),
                        session_fp: prepared.session_fp.clone(),
                        owner_id: Some(caller.owner_id.clone()),
                        model_family: family.clone(),
                        client_type: Some(caller.client_type.to_string()),
                        ttl_secs: Some(policy.signature_ttl_secs),
                        ..PutKeys::default()
                    },
                );
                last_signature = Some(sig.clone());
            }
            ContentBlock::ToolUse { id, .. } => {
                if let Some(sig) = &last_signature {
                    state.store.put(
                        sig,
                        PutKeys {
                            tool_id: Some(id.clone()),
                            owner_id: Some(caller.owner_id.clone()),
                            model_family: family.clone(),
                            client_type: Some(caller.client_type.to_string()),
                            ttl_secs: Some(policy.signature_ttl_secs),
                            ..PutKeys::default()
                        },
                    );
                }
            }
            _ => {}
        }
    }

    state.conversations.commit_turn(
        &prepared.scid,
        prepared.request.messages.clone(),
        Message::assistant(resp.content.clone()),
    );

    if let Some(usage) = &state.usage {
        if let Err(e) = usage.record(
            &outcome.model,
            &outcome.backend,
            &outcome.credential_id,
            resp.usage.input_tokens,
            resp.usage.output_tokens,
        ) {
            warn!(error = %e, "usage record failed");
        }
    }
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// A launched streaming request: events on `rx`, the route outcome (or
/// pre-stream failure) on `handle`.
pub struct ActiveStream {
    pub rx: mpsc::Receiver<StreamEvent>,
    pub handle: JoinHandle<Result<RouteOutcome, RouterError>>,
}

/// Launch the upstream stream. The first received event decides between a
/// streaming response and an error status — a chain that dies before the
/// first byte still gets a proper HTTP error.
pub async fn start_stream(
    state: Arc<AppState>,
    request: ChatRequest,
    caller: CallerIdentity,
    pinned: Option<String>,
) -> (Option<StreamEvent>, ActiveStream) {
    let policy = caller.client_type.policy();
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

    let handle = tokio::spawn(async move {
        state
            .router
            .send_stream(
                &request,
                &policy,
                &caller.forward_headers,
                pinned.as_deref(),
                tx,
            )
            .await
    });

    let first = rx.recv().await;
    (first, ActiveStream { rx, handle })
}

/// Assembles the assistant message out of stream events, writing signatures
/// into the store the moment they are captured — a disconnect later in the
/// stream must not lose them.
pub struct StreamCollector {
    state: Arc<AppState>,
    caller: CallerIdentity,
    scid: String,
    sent_messages: Vec<Message>,
    session_fp: Option<String>,
    model: String,
    family: String,
    thinking: String,
    signature: Option<String>,
    text: String,
    tool_uses: Vec<(String, String, serde_json::Value)>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: StopReason,
    errored: bool,
}

impl StreamCollector {
    pub fn new(state: Arc<AppState>, caller: CallerIdentity, prepared: &PreparedRequest) -> Self {
        Self {
            state,
            caller,
            scid: prepared.scid.clone(),
            sent_messages: prepared.request.messages.clone(),
            session_fp: prepared.session_fp.clone(),
            model: prepared.request.model.clone(),
            family: aero_backend::router::model_family(&prepared.request.model).to_string(),
            thinking: String::new(),
            signature: None,
            text: String::new(),
            tool_uses: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: StopReason::EndTurn,
            errored: false,
        }
    }

    /// Fold one event into the pending assistant message. Signature captures
    /// hit the store immediately.
    pub fn absorb(&mut self, event: &StreamEvent) {
        let policy = self.caller.client_type.policy();
        match event {
            StreamEvent::MessageStart {
                model,
                input_tokens,
            } => {
                if !model.is_empty() {
                    self.model = model.clone();
                }
                self.input_tokens = *input_tokens;
            }
            StreamEvent::ThinkingDelta { text } => self.thinking.push_str(text),
            StreamEvent::SignatureCaptured { signature } => {
                self.signature = Some(signature.clone());
                self.state.store.put(
                    signature,
                    PutKeys {
                        content: (!self.thinking.is_empty()).then(|| self.thinking.clone()),
                        session_fp: self.session_fp.clone(),
                        owner_id: Some(self.caller.owner_id.clone()),
                        model_family: self.family.clone(),
                        client_type: Some(self.caller.client_type.to_string()),
                        ttl_secs: Some(policy.signature_ttl_secs),
                        ..PutKeys::default()
                    },
                );
            }
            StreamEvent::TextDelta { text } => self.text.push_str(text),
            StreamEvent::ToolUse { id, name, input } => {
                if let Some(sig) = &self.signature {
                    self.state.store.put(
                        sig,
                        PutKeys {
                            tool_id: Some(id.clone()),
                            owner_id: Some(self.caller.owner_id.clone()),
                            model_family: self.family.clone(),
                            client_type: Some(self.caller.client_type.to_string()),
                            ttl_secs: Some(policy.signature_ttl_secs),
                            ..PutKeys::default()
                        },
                    );
                }
                self.tool_uses.push((id.clone(), name.clone(), input.clone()));
            }
            StreamEvent::Finish {
                stop_reason,
                input_tokens,
                output_tokens,
                synthesized,
            } => {
                if *input_tokens > 0 {
                    self.input_tokens = *input_tokens;
                }
                self.output_tokens = *output_tokens;
                self.stop_reason = *stop_reason;
                if *synthesized {
                    warn!(model = %self.model, "stream finished without upstream finish reason");
                }
            }
            StreamEvent::Error { .. } => self.errored = true,
        }
    }

    /// The id a tool call should be emitted under for this client: encoded
    /// with the captured signature when the client round-trips long ids.
    pub fn emit_tool_id(&self, id: &str) -> String {
        let policy = self.caller.client_type.policy();
        if policy.supports_id_encoding {
            thought_id::encode(id, self.signature.as_deref())
        } else {
            id.to_string()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn input_tokens(&self) -> u32 {
        self.input_tokens
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Commit the completed turn to the authoritative history and record
    /// usage against the route the stream actually took. An errored stream
    /// is not committed — only successful round-trips update the record.
    pub fn finalize(self, outcome: Option<&RouteOutcome>) {
        if self.errored {
            info!(scid = %self.scid, "stream errored, turn not committed");
            return;
        }
        let mut content: Vec<ContentBlock> = Vec::new();
        if !self.thinking.is_empty() || self.signature.is_some() {
            content.push(ContentBlock::Thinking {
                thinking: self.thinking.clone(),
                signature: self.signature.clone(),
                redacted: false,
            });
        }
        if !self.text.is_empty() {
            content.push(ContentBlock::text(self.text.clone()));
        }
        for (id, name, input) in &self.tool_uses {
            content.push(ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
        }
        if content.is_empty() {
            info!(scid = %self.scid, "stream produced no content, skipping commit");
            return;
        }

        debug!(scid = %self.scid, stop_reason = ?self.stop_reason, "committing streamed turn");
        self.state.conversations.commit_turn(
            &self.scid,
            self.sent_messages.clone(),
            Message::assistant(content),
        );

        if let (Some(usage), Some(outcome)) = (&self.state.usage, outcome) {
            if let Err(e) = usage.record(
                &outcome.model,
                &outcome.backend,
                &outcome.credential_id,
                self.input_tokens,
                self.output_tokens,
            ) {
                warn!(error = %e, "usage record failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_backend::adapter::{BackendAdapter, BackendError, CallContext};
    use aero_backend::{BackendRouter, RouterSlot};
    use aero_core::client::ClientType;
    use aero_core::config::{AeroConfig, ApiFormat, BackendConfig, RetryConfig};
    use aero_protocol::model::{Role, ToolDefinition, Usage};
    use async_trait::async_trait;
    use serde_json::json;

    struct CannedAdapter {
        response: ChatResponse,
    }

    #[async_trait]
    impl BackendAdapter for CannedAdapter {
        fn key(&self) -> &str {
            "primary"
        }
        fn api_format(&self) -> ApiFormat {
            ApiFormat::Anthropic
        }
        async fn send(
            &self,
            _req: &ChatRequest,
            _ctx: &CallContext,
        ) -> Result<ChatResponse, BackendError> {
            Ok(self.response.clone())
        }
    }

    fn test_state(response: ChatResponse) -> Arc<AppState> {
        let credentials = Arc::new(aero_auth::CredentialManager::new(0.1, 300, 100, true));
        credentials.register("primary", aero_auth::Credential::from_api_key("c1", "sk"));

        let config = BackendConfig {
            key: "primary".into(),
            display_name: None,
            base_urls: vec!["https://upstream.test".into()],
            api_format: ApiFormat::Anthropic,
            priority: 10,
            timeout_secs: 60,
            stream_timeout_secs: 300,
            max_retries: 1,
            enabled: true,
            api_keys: vec![],
            models: vec![],
        };
        let router = BackendRouter::new(
            vec![RouterSlot {
                adapter: Arc::new(CannedAdapter { response }),
                config,
            }],
            vec![],
            credentials.clone(),
            RetryConfig::default(),
            reqwest::Client::new(),
        );

        Arc::new(AppState {
            config: AeroConfig::default(),
            store: Arc::new(aero_cache::SignatureStore::in_memory(100)),
            credentials,
            conversations: Arc::new(aero_state::ConversationManager::in_memory(3_600)),
            usage: None,
            router,
            started_at: 0,
        })
    }

    fn caller(client_type: ClientType, scid: Option<String>) -> CallerIdentity {
        CallerIdentity {
            owner_id: "owner-test".into(),
            client_type,
            scid,
            forward_headers: vec![],
        }
    }

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "claude-x".into(),
            system: None,
            messages,
            max_tokens: 1_024,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: vec![],
            thinking_budget: None,
            tools: vec![ToolDefinition {
                name: "read_file".into(),
                description: String::new(),
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    fn signed_tool_response(sig: &str) -> ChatResponse {
        ChatResponse {
            model: "claude-x".into(),
            content: vec![
                ContentBlock::Thinking {
                    thinking: "choosing the file".into(),
                    signature: Some(sig.to_string()),
                    redacted: false,
                },
                ContentBlock::ToolUse {
                    id: "call_abc".into(),
                    name: "read_file".into(),
                    input: json!({"path": "/x"}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 20,
            },
        }
    }

    #[tokio::test]
    async fn prepare_issues_scid_and_fixes_tool_chains() {
        let state = test_state(signed_tool_response(&"s".repeat(64)));
        let messages = vec![
            Message::user(vec![ContentBlock::text("hi")]),
            Message::assistant(vec![ContentBlock::ToolUse {
                id: "orphan".into(),
                name: "t".into(),
                input: json!({}),
            }]),
            Message::user(vec![ContentBlock::text("continue")]),
        ];
        let prepared = prepare(&state, request(messages), &caller(ClientType::Cli, None));

        assert!(prepared.scid.starts_with("conv_"));
        assert_eq!(prepared.report.tool_chains_fixed, 1);
        assert!(prepared.request.messages[1]
            .content
            .iter()
            .all(|b| !b.is_tool_use()));
    }

    #[tokio::test]
    async fn tool_id_round_trip_with_signature() {
        let sig = "g".repeat(120);
        let state = test_state(signed_tool_response(&sig));
        let cli = caller(ClientType::Cli, None);

        // Turn 1: upstream emits a signed thinking block plus a tool call;
        // the client-facing id carries the signature.
        let prepared = prepare(
            &state,
            request(vec![Message::user(vec![ContentBlock::text("read it")])]),
            &cli,
        );
        let (resp, outcome) = execute(&state, &prepared, &cli, None).await.unwrap();
        assert_eq!(outcome.backend, "primary");

        let emitted_id = resp
            .content
            .iter()
            .find_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(emitted_id, format!("call_abc__thought__{sig}"));

        // The signature is discoverable under content and tool-id keys.
        assert_eq!(
            state.store.get_by_content("choosing the file", Some("owner-test")),
            Some(sig.clone())
        );
        assert_eq!(
            state.store.get_by_tool_id("call_abc", Some("owner-test")),
            Some(sig.clone())
        );

        // Turn 2: the client replays the encoded id with its tool result and
        // a thinking block stripped of its signature. Sanitization restores
        // both the original id and the signature.
        let cli2 = caller(ClientType::Cli, Some(prepared.scid.clone()));
        let replay = vec![
            Message::user(vec![ContentBlock::text("read it")]),
            Message::assistant(vec![
                ContentBlock::Thinking {
                    thinking: "choosing the file".into(),
                    signature: None,
                    redacted: false,
                },
                ContentBlock::ToolUse {
                    id: emitted_id.clone(),
                    name: "read_file".into(),
                    input: json!({"path": "/x"}),
                },
            ]),
            Message::user(vec![ContentBlock::ToolResult {
                tool_use_id: emitted_id,
                content: json!("file data"),
                is_error: false,
            }]),
        ];
        let mut second = request(replay);
        second.thinking_budget = Some(4_096);
        let prepared2 = prepare(&state, second, &cli2);

        assert!(prepared2.request.thinking_enabled());
        let assistant = prepared2
            .request
            .messages
            .iter()
            .rfind(|m| m.role == Role::Assistant)
            .unwrap();
        match &assistant.content[0] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some(sig.as_str()));
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &assistant.content[1] {
            ContentBlock::ToolUse { id, .. } => assert_eq!(id, "call_abc"),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn authoritative_history_beats_mangled_replay() {
        let sig = "h".repeat(120);
        let state = test_state(signed_tool_response(&sig));
        let cli = caller(ClientType::Cli, None);

        let prepared = prepare(
            &state,
            request(vec![Message::user(vec![ContentBlock::text("read it")])]),
            &cli,
        );
        execute(&state, &prepared, &cli, None).await.unwrap();

        // The committed turn kept the signed thinking block.
        let (_, handle) = state.conversations.get_or_create(Some(&prepared.scid), "cli");
        {
            let conversation = handle.lock().unwrap();
            assert_eq!(conversation.history.len(), 2);
            assert_eq!(conversation.last_signature.as_deref(), Some(sig.as_str()));
        }

        // An unreliable client replays garbage; only its last user turn is
        // accepted on top of the authoritative record.
        let ide = caller(ClientType::InlineIde, Some(prepared.scid.clone()));
        let prepared2 = prepare(
            &state,
            request(vec![
                Message::assistant(vec![ContentBlock::text("forged")]),
                Message::user(vec![ContentBlock::text("next question")]),
            ]),
            &ide,
        );
        assert_eq!(prepared2.request.messages.len(), 3);
        assert_eq!(prepared2.request.messages[0].plain_text(), "read it");
        assert_eq!(
            prepared2.request.messages[2].plain_text(),
            "next question"
        );
    }

    #[tokio::test]
    async fn budget_clamped_during_prepare() {
        let state = test_state(signed_tool_response(&"s".repeat(64)));
        let mut req = request(vec![Message::user(vec![ContentBlock::text("hi")])]);
        req.thinking_budget = Some(aero_core::config::THINKING_HARD_CAP);
        req.max_tokens = aero_core::config::THINKING_HARD_CAP;

        let prepared = prepare(&state, req, &caller(ClientType::Cli, None));
        let budget = prepared.request.thinking_budget.unwrap();
        assert!(budget < aero_core::config::THINKING_HARD_CAP);
        assert!(prepared.request.max_tokens >= budget + aero_core::config::MIN_OUTPUT_TOKENS);
    }
}
