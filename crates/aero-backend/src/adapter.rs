//! Common interface for upstream backend adapters.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use aero_auth::AcquiredCredential;
use aero_core::config::ApiFormat;
use aero_protocol::model::{ChatRequest, ChatResponse};

use crate::stream::StreamEvent;

/// Per-call context: the selected credential plus whitelisted client headers
/// forwarded for upstream telemetry.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub auth: AcquiredCredential,
    pub forward_headers: Vec<(String, String)>,
}

impl CallContext {
    pub fn new(auth: AcquiredCredential) -> Self {
        Self {
            auth,
            forward_headers: Vec::new(),
        }
    }
}

/// Common interface for all upstream adapters (Gemini, Anthropic,
/// OpenAI-compatible, and in-process).
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend key for logging and diagnostics.
    fn key(&self) -> &str;

    fn api_format(&self) -> ApiFormat;

    /// Send a non-streaming request, wait for the full response.
    async fn send(&self, req: &ChatRequest, ctx: &CallContext)
        -> Result<ChatResponse, BackendError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming send, emits the response as
    /// a burst of events.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        ctx: &CallContext,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        let resp = self.send(req, ctx).await?;
        let _ = tx
            .send(StreamEvent::MessageStart {
                model: resp.model.clone(),
                input_tokens: resp.usage.input_tokens,
            })
            .await;
        for event in crate::stream::response_to_events(&resp) {
            let _ = tx.send(event).await;
        }
        let _ = tx
            .send(StreamEvent::Finish {
                stop_reason: resp.stop_reason,
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
                synthesized: false,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        retry_after_ms: u64,
        /// True for explicit per-model quota exhaustion, which cools the
        /// credential down instead of being retried in place.
        quota_exhausted: bool,
    },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Internal adapter error: {0}")]
    Internal(String),
}

/// Local-service shortcut: tries an in-process adapter first and falls back
/// to the HTTP adapter for the same address on any internal error.
pub struct FallbackAdapter {
    primary: Box<dyn BackendAdapter>,
    fallback: Box<dyn BackendAdapter>,
}

impl FallbackAdapter {
    pub fn new(primary: Box<dyn BackendAdapter>, fallback: Box<dyn BackendAdapter>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl BackendAdapter for FallbackAdapter {
    fn key(&self) -> &str {
        self.primary.key()
    }

    fn api_format(&self) -> ApiFormat {
        self.primary.api_format()
    }

    async fn send(
        &self,
        req: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, BackendError> {
        match self.primary.send(req, ctx).await {
            Err(BackendError::Internal(reason)) => {
                warn!(backend = self.primary.key(), %reason, "in-process call failed, using HTTP path");
                self.fallback.send(req, ctx).await
            }
            other => other,
        }
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        ctx: &CallContext,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        match self.primary.send_stream(req, ctx, tx.clone()).await {
            Err(BackendError::Internal(reason)) => {
                warn!(backend = self.primary.key(), %reason, "in-process stream failed, using HTTP path");
                self.fallback.send_stream(req, ctx, tx).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_protocol::model::{ContentBlock, Message, StopReason, Usage};

    struct Fails;
    struct Succeeds;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            system: None,
            messages: vec![Message::user(vec![ContentBlock::text("hi")])],
            max_tokens: 64,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: vec![],
            thinking_budget: None,
            tools: vec![],
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(AcquiredCredential {
            id: "c1".into(),
            access_token: "tok".into(),
        })
    }

    #[async_trait]
    impl BackendAdapter for Fails {
        fn key(&self) -> &str {
            "local"
        }
        fn api_format(&self) -> ApiFormat {
            ApiFormat::Anthropic
        }
        async fn send(
            &self,
            _req: &ChatRequest,
            _ctx: &CallContext,
        ) -> Result<ChatResponse, BackendError> {
            Err(BackendError::Internal("broken".into()))
        }
    }

    #[async_trait]
    impl BackendAdapter for Succeeds {
        fn key(&self) -> &str {
            "local"
        }
        fn api_format(&self) -> ApiFormat {
            ApiFormat::Anthropic
        }
        async fn send(
            &self,
            req: &ChatRequest,
            _ctx: &CallContext,
        ) -> Result<ChatResponse, BackendError> {
            Ok(ChatResponse {
                model: req.model.clone(),
                content: vec![ContentBlock::text("ok")],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            })
        }
    }

    #[tokio::test]
    async fn internal_error_falls_back_to_http_path() {
        let adapter = FallbackAdapter::new(Box::new(Fails), Box::new(Succeeds));
        let resp = adapter.send(&request(), &ctx()).await.unwrap();
        assert_eq!(resp.content, vec![ContentBlock::text("ok")]);
    }

    #[tokio::test]
    async fn non_internal_errors_do_not_fall_back() {
        struct ApiError;
        #[async_trait]
        impl BackendAdapter for ApiError {
            fn key(&self) -> &str {
                "local"
            }
            fn api_format(&self) -> ApiFormat {
                ApiFormat::Anthropic
            }
            async fn send(
                &self,
                _req: &ChatRequest,
                _ctx: &CallContext,
            ) -> Result<ChatResponse, BackendError> {
                Err(BackendError::Api {
                    status: 400,
                    message: "bad".into(),
                })
            }
        }
        let adapter = FallbackAdapter::new(Box::new(ApiError), Box::new(Succeeds));
        let err = adapter.send(&request(), &ctx()).await.unwrap_err();
        assert!(matches!(err, BackendError::Api { status: 400, .. }));
    }
}
