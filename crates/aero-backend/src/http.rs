//! Shared HTTP plumbing for the upstream adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::warn;

use aero_core::config::BackendConfig;

use crate::adapter::{BackendError, CallContext};
use crate::classify::parse_retry_delay_ms;

/// Base-URL pool, reqwest clients, and status triage shared by the three
/// dialect adapters.
pub struct HttpCore {
    pub key: String,
    base_urls: Vec<String>,
    cursor: AtomicUsize,
    /// Client for non-streaming calls (full-request timeout).
    pub client: reqwest::Client,
    /// Client for streaming calls (longer stream timeout).
    pub stream_client: reqwest::Client,
}

impl HttpCore {
    pub fn new(config: &BackendConfig, proxy: Option<&str>) -> Result<Self, BackendError> {
        let build = |timeout_secs: u64| {
            let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout_secs));
            if let Some(proxy) = proxy {
                match reqwest::Proxy::all(proxy) {
                    Ok(p) => builder = builder.proxy(p),
                    Err(e) => warn!(proxy, error = %e, "invalid outbound proxy, ignoring"),
                }
            }
            builder
                .build()
                .map_err(|e| BackendError::Internal(format!("client build failed: {e}")))
        };

        Ok(Self {
            key: config.key.clone(),
            base_urls: config.base_urls.clone(),
            cursor: AtomicUsize::new(0),
            client: build(config.timeout_secs)?,
            stream_client: build(config.stream_timeout_secs)?,
        })
    }

    /// Current base URL, without trailing slash.
    pub fn base_url(&self) -> &str {
        let idx = self.cursor.load(Ordering::Relaxed) % self.base_urls.len();
        self.base_urls[idx].trim_end_matches('/')
    }

    /// Round-robin to the next base URL after a connect failure.
    pub fn rotate_base_url(&self) {
        if self.base_urls.len() > 1 {
            let next = (self.cursor.load(Ordering::Relaxed) + 1) % self.base_urls.len();
            self.cursor.store(next, Ordering::Relaxed);
            warn!(backend = %self.key, url = %self.base_urls[next], "rotated to next base url");
        }
    }

    /// Attach whitelisted client headers (IDE telemetry markers).
    pub fn apply_forward_headers(
        &self,
        mut builder: reqwest::RequestBuilder,
        ctx: &CallContext,
    ) -> reqwest::RequestBuilder {
        for (name, value) in &ctx.forward_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Map a connect-level error, rotating the base URL pool so the retry
    /// lands on the next address.
    pub fn map_send_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_connect() || err.is_timeout() {
            self.rotate_base_url();
        }
        BackendError::Http(err)
    }
}

/// Common status triage: 429 to RateLimited (with retry-after and the quota
/// marker), other non-2xx to Api.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        let header_ms = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body = resp.text().await.unwrap_or_default();
        let retry_after_ms = header_ms
            .or_else(|| parse_retry_delay_ms(&body))
            .unwrap_or(5_000);
        let quota_exhausted =
            body.contains("QUOTA_EXHAUSTED") || body.contains("quota_exhausted");
        return Err(BackendError::RateLimited {
            retry_after_ms,
            quota_exhausted,
        });
    }
    if !status.is_success() {
        let code = status.as_u16();
        let text = resp.text().await.unwrap_or_default();
        warn!(status = code, body = %text, "upstream API error");
        return Err(BackendError::Api {
            status: code,
            message: text,
        });
    }
    Ok(resp)
}
