//! Anthropic-compatible upstream adapter.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use aero_core::config::{ApiFormat, BackendConfig};
use aero_protocol::anthropic;
use aero_protocol::model::{ChatRequest, ChatResponse};

use crate::adapter::{BackendAdapter, BackendError, CallContext};
use crate::http::{check_status, HttpCore};
use crate::stream::StreamEvent;

const API_VERSION: &str = "2023-06-01";
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";

pub struct AnthropicAdapter {
    core: HttpCore,
}

impl AnthropicAdapter {
    pub fn new(config: &BackendConfig, proxy: Option<&str>) -> Result<Self, BackendError> {
        Ok(Self {
            core: HttpCore::new(config, proxy)?,
        })
    }

    /// OAuth tokens use Bearer auth; regular API keys use x-api-key.
    fn apply_auth(
        &self,
        builder: reqwest::RequestBuilder,
        ctx: &CallContext,
    ) -> reqwest::RequestBuilder {
        if ctx.auth.access_token.starts_with(OAUTH_TOKEN_PREFIX) {
            builder.header(
                "Authorization",
                format!("Bearer {}", ctx.auth.access_token),
            )
        } else {
            builder.header("x-api-key", &ctx.auth.access_token)
        }
    }

    fn request(
        &self,
        client: &reqwest::Client,
        req: &ChatRequest,
        ctx: &CallContext,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/messages", self.core.base_url());
        let mut body = anthropic::encode_request(req);
        body["stream"] = serde_json::json!(stream);

        let builder = client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        let builder = self.apply_auth(builder, ctx);
        self.core.apply_forward_headers(builder, ctx)
    }
}

#[async_trait]
impl BackendAdapter for AnthropicAdapter {
    fn key(&self) -> &str {
        &self.core.key
    }

    fn api_format(&self) -> ApiFormat {
        ApiFormat::Anthropic
    }

    async fn send(
        &self,
        req: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, BackendError> {
        debug!(backend = %self.core.key, model = %req.model, "sending request upstream");
        let resp = self
            .request(&self.core.client, req, ctx, false)
            .send()
            .await
            .map_err(|e| self.core.map_send_error(e))?;
        let resp = check_status(resp).await?;

        let body: serde_json::Value =
            resp.json().await.map_err(|e| BackendError::Parse(e.to_string()))?;
        anthropic::parse_response(&body).map_err(|e| BackendError::Parse(e.to_string()))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        ctx: &CallContext,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        debug!(backend = %self.core.key, model = %req.model, "sending streaming request upstream");
        let resp = self
            .request(&self.core.stream_client, req, ctx, true)
            .send()
            .await
            .map_err(|e| self.core.map_send_error(e))?;
        let resp = check_status(resp).await?;

        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }
}
