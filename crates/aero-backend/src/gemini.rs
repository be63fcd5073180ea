//! Gemini-family upstream adapter (native generateContent wire).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use aero_core::config::{ApiFormat, BackendConfig};
use aero_protocol::gemini;
use aero_protocol::model::{ChatRequest, ChatResponse};

use crate::adapter::{BackendAdapter, BackendError, CallContext};
use crate::http::{check_status, HttpCore};
use crate::stream::StreamEvent;

pub struct GeminiAdapter {
    core: HttpCore,
}

impl GeminiAdapter {
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
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut url = format!(
            "{}/v1beta/models/{}:{}",
            self.core.base_url(),
            req.model,
            method
        );
        if stream {
            url.push_str("?alt=sse");
        }
        let body = gemini::encode_request(req);

        let builder = client
            .post(&url)
            .bearer_auth(&ctx.auth.access_token)
            .header("content-type", "application/json")
            .json(&body);
        self.core.apply_forward_headers(builder, ctx)
    }
}

#[async_trait]
impl BackendAdapter for GeminiAdapter {
    fn key(&self) -> &str {
        &self.core.key
    }

    fn api_format(&self) -> ApiFormat {
        ApiFormat::Gemini
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
        gemini::parse_response(&req.model, &body).map_err(|e| BackendError::Parse(e.to_string()))
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

        crate::gemini_stream::process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}
