//! OpenAI-compatible upstream adapter. Also fronts the third-party proxies
//! that speak this dialect.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use aero_core::config::{ApiFormat, BackendConfig};
use aero_protocol::model::{ChatRequest, ChatResponse};
use aero_protocol::openai;

use crate::adapter::{BackendAdapter, BackendError, CallContext};
use crate::http::{check_status, HttpCore};
use crate::stream::StreamEvent;

pub struct OpenAiAdapter {
    core: HttpCore,
}

impl OpenAiAdapter {
    pub fn new(config: &BackendConfig, proxy: Option<&str>) -> Result<Self, BackendError> {
        Ok(Self {
            core: HttpCore::new(config, proxy)?,
        })
    }

    fn request(
        &self,
        client: &reqwest::Client,
        req: &ChatRequest,
        ctx: &CallContext,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.core.base_url());
        let mut body = openai::encode_request(req);
        body["stream"] = serde_json::json!(stream);
        if stream {
            // Ask compatible upstreams to attach usage to the final chunk.
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        let builder = client
            .post(&url)
            .bearer_auth(&ctx.auth.access_token)
            .header("content-type", "application/json")
            .json(&body);
        self.core.apply_forward_headers(builder, ctx)
    }
}

#[async_trait]
impl BackendAdapter for OpenAiAdapter {
    fn key(&self) -> &str {
        &self.core.key
    }

    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAi
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
        openai::parse_response(&body).map_err(|e| BackendError::Parse(e.to_string()))
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

        crate::openai_stream::process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}
