//! Backend chain resolution and failover.
//!
//! The router is the single place upstream failures become retry/advance
//! decisions: transient errors retry in place with backoff, quota exhaustion
//! rotates credentials within the backend, auth failures disable the
//! credential, and everything non-retriable advances the chain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use aero_auth::{CredentialManager, FailureKind};
use aero_core::client::ClientPolicy;
use aero_core::config::{BackendConfig, RetryConfig, RouteRule};
use aero_protocol::model::{ChatRequest, ChatResponse};

use crate::adapter::{BackendAdapter, BackendError, CallContext};
use crate::classify::{classify, FailureClass};
use crate::health::HealthTracker;
use crate::stream::StreamEvent;

pub struct RouterSlot {
    pub adapter: Arc<dyn BackendAdapter>,
    pub config: BackendConfig,
}

/// Where a successful request actually landed.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub backend: String,
    pub credential_id: String,
    pub model: String,
}

/// One backend's terminal failure, for the 503 diagnostic body.
#[derive(Debug, Clone)]
pub struct BackendFailure {
    pub backend: String,
    pub class: FailureClass,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no backend accepts model '{0}'")]
    UnsupportedModel(String),

    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("all backends exhausted")]
    ChainExhausted { failures: Vec<BackendFailure> },
}

impl RouterError {
    /// Per-backend diagnostic lines for the chain-exhaustion body.
    pub fn failure_lines(&self) -> Vec<String> {
        match self {
            RouterError::ChainExhausted { failures } => failures
                .iter()
                .map(|f| format!("backend {}: {}", f.backend, f.class.label()))
                .collect(),
            other => vec![other.to_string()],
        }
    }
}

pub struct BackendRouter {
    slots: Vec<RouterSlot>,
    routes: Vec<RouteRule>,
    credentials: Arc<CredentialManager>,
    retry: RetryConfig,
    /// Client for token refresh against identity endpoints (may be routed
    /// through a dedicated proxy).
    refresh_client: reqwest::Client,
    health: Arc<HealthTracker>,
}

impl BackendRouter {
    pub fn new(
        mut slots: Vec<RouterSlot>,
        routes: Vec<RouteRule>,
        credentials: Arc<CredentialManager>,
        retry: RetryConfig,
        refresh_client: reqwest::Client,
    ) -> Self {
        slots.sort_by_key(|s| s.config.priority);
        Self {
            slots,
            routes,
            credentials,
            retry,
            refresh_client,
            health: Arc::new(HealthTracker::new()),
        }
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub fn slots(&self) -> &[RouterSlot] {
        &self.slots
    }

    /// Ordered (slot index, target model) chain for a requested model.
    ///
    /// A pinned backend (direct-addressed /{backend}/v1/... call) restricts
    /// the chain to that backend. Otherwise an explicit route rule wins, and
    /// every enabled backend that accepts the model is the fallback, in
    /// priority order.
    pub fn resolve_chain(&self, model: &str, pinned: Option<&str>) -> Vec<(usize, String)> {
        if let Some(backend) = pinned {
            return self
                .slots
                .iter()
                .position(|s| s.config.key == backend && s.config.enabled)
                .map(|idx| vec![(idx, model.to_string())])
                .unwrap_or_default();
        }

        if let Some(rule) = self.routes.iter().find(|r| r.matches(model)) {
            return rule
                .chain
                .iter()
                .filter_map(|step| {
                    let idx = self
                        .slots
                        .iter()
                        .position(|s| s.config.key == step.backend && s.config.enabled)?;
                    Some((idx, step.model.clone().unwrap_or_else(|| model.to_string())))
                })
                .collect();
        }

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.config.enabled && s.config.accepts_model(model))
            .map(|(idx, _)| (idx, model.to_string()))
            .collect()
    }

    /// Non-streaming request with full chain failover.
    pub async fn send(
        &self,
        req: &ChatRequest,
        policy: &ClientPolicy,
        forward_headers: &[(String, String)],
        pinned: Option<&str>,
    ) -> Result<(ChatResponse, RouteOutcome), RouterError> {
        let chain = self.resolve_chain(&req.model, pinned);
        if chain.is_empty() {
            return Err(RouterError::UnsupportedModel(req.model.clone()));
        }

        let mut failures: Vec<BackendFailure> = Vec::new();

        for (slot_idx, target_model) in chain {
            let slot = &self.slots[slot_idx];
            let mut request = req.clone();
            request.model = target_model.clone();

            match self
                .try_backend(slot, &mut request, policy, forward_headers, None)
                .await
            {
                Ok((resp, outcome)) => return Ok((resp, outcome)),
                Err(TryBackendError::Fatal(e)) => return Err(e),
                Err(TryBackendError::Advance(failure)) => {
                    info!(
                        backend = %failure.backend,
                        reason = failure.class.label(),
                        "backend exhausted, advancing chain"
                    );
                    failures.push(failure);
                }
            }
        }

        Err(RouterError::ChainExhausted { failures })
    }

    /// Streaming request. Failover only applies before the first byte: an
    /// adapter returns `Err` pre-stream (HTTP status triage), and mid-stream
    /// failures surface as `StreamEvent::Error` on `tx` instead.
    pub async fn send_stream(
        &self,
        req: &ChatRequest,
        policy: &ClientPolicy,
        forward_headers: &[(String, String)],
        pinned: Option<&str>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<RouteOutcome, RouterError> {
        let chain = self.resolve_chain(&req.model, pinned);
        if chain.is_empty() {
            return Err(RouterError::UnsupportedModel(req.model.clone()));
        }

        let mut failures: Vec<BackendFailure> = Vec::new();

        for (slot_idx, target_model) in chain {
            let slot = &self.slots[slot_idx];
            let mut request = req.clone();
            request.model = target_model.clone();

            match self
                .try_backend(slot, &mut request, policy, forward_headers, Some(tx.clone()))
                .await
            {
                Ok((_, outcome)) => return Ok(outcome),
                Err(TryBackendError::Fatal(e)) => return Err(e),
                Err(TryBackendError::Advance(failure)) => {
                    info!(
                        backend = %failure.backend,
                        reason = failure.class.label(),
                        "backend exhausted, advancing chain"
                    );
                    failures.push(failure);
                }
            }
        }

        Err(RouterError::ChainExhausted { failures })
    }

    /// All attempts against one backend: credential rotation outside,
    /// transient retries inside.
    async fn try_backend(
        &self,
        slot: &RouterSlot,
        request: &mut ChatRequest,
        policy: &ClientPolicy,
        forward_headers: &[(String, String)],
        stream_tx: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<(ChatResponse, RouteOutcome), TryBackendError> {
        let backend = &slot.config.key;
        let pool_size = self.credentials.pool_size(backend);
        if pool_size == 0 {
            return Err(TryBackendError::Advance(BackendFailure {
                backend: backend.clone(),
                class: FailureClass::AuthFailure,
                message: "no credentials configured".into(),
            }));
        }

        let (same_family, cross_family) = family_alternates(&slot.config, &request.model);
        let mut last: Option<(FailureClass, String)> = None;

        for _ in 0..pool_size {
            let Some((auth, granted_model)) = self.credentials.acquire_for_models(
                backend,
                &request.model,
                &same_family,
                &cross_family,
                policy.enable_cross_pool,
            ) else {
                break;
            };
            request.model = granted_model;

            // Refresh near-expiry OAuth tokens before spending an attempt.
            let auth = match aero_auth::refresh::ensure_fresh(
                &self.refresh_client,
                &self.credentials,
                backend,
                &auth.id,
            )
            .await
            {
                Ok(()) => self
                    .credentials
                    .snapshot(backend, &auth.id)
                    .map(|c| aero_auth::AcquiredCredential {
                        id: c.id,
                        access_token: c.access_token,
                    })
                    .unwrap_or(auth),
                Err(e) => {
                    warn!(backend = %backend, credential = %auth.id, error = %e, "token refresh failed");
                    self.credentials.report_failure(
                        backend,
                        &auth.id,
                        &request.model,
                        FailureKind::Auth,
                        None,
                    );
                    last = Some((FailureClass::AuthFailure, e.to_string()));
                    continue;
                }
            };

            let ctx = CallContext {
                auth,
                forward_headers: forward_headers.to_vec(),
            };

            for attempt in 0..=slot.config.max_retries {
                let started = Instant::now();
                let result = match &stream_tx {
                    Some(tx) => slot
                        .adapter
                        .send_stream(request, &ctx, tx.clone())
                        .await
                        .map(|()| None),
                    None => slot.adapter.send(request, &ctx).await.map(Some),
                };

                match result {
                    Ok(resp) => {
                        self.health
                            .record_success(backend, started.elapsed().as_millis() as u64);
                        self.credentials.report_success(backend, &ctx.auth.id, None);
                        let outcome = RouteOutcome {
                            backend: backend.clone(),
                            credential_id: ctx.auth.id.clone(),
                            model: request.model.clone(),
                        };
                        // Streaming has no ChatResponse; a placeholder is
                        // never read because send_stream discards it.
                        let resp = resp.unwrap_or_else(|| ChatResponse {
                            model: request.model.clone(),
                            content: Vec::new(),
                            stop_reason: aero_protocol::model::StopReason::EndTurn,
                            usage: Default::default(),
                        });
                        return Ok((resp, outcome));
                    }
                    Err(e) => {
                        let class = classify(&e);
                        self.health.record_error(backend, class, &e.to_string());
                        warn!(
                            backend = %backend,
                            credential = %ctx.auth.id,
                            attempt,
                            class = class.label(),
                            error = %e,
                            "upstream attempt failed"
                        );
                        last = Some((class, e.to_string()));

                        match class {
                            FailureClass::TransientUpstream => {
                                if attempt < slot.config.max_retries {
                                    tokio::time::sleep(self.backoff(&e, attempt)).await;
                                    continue;
                                }
                                // Retries exhausted: next backend.
                                return Err(TryBackendError::Advance(BackendFailure {
                                    backend: backend.clone(),
                                    class,
                                    message: e.to_string(),
                                }));
                            }
                            FailureClass::QuotaExhausted => {
                                let retry_after = match &e {
                                    BackendError::RateLimited { retry_after_ms, .. } => {
                                        Some(retry_after_ms / 1000)
                                    }
                                    _ => None,
                                };
                                self.credentials.report_failure(
                                    backend,
                                    &ctx.auth.id,
                                    &request.model,
                                    FailureKind::Quota,
                                    retry_after,
                                );
                                break; // next credential
                            }
                            FailureClass::AuthFailure => {
                                self.credentials.report_failure(
                                    backend,
                                    &ctx.auth.id,
                                    &request.model,
                                    FailureKind::Auth,
                                    None,
                                );
                                break; // next credential
                            }
                            FailureClass::InvariantViolation => {
                                // Sanitization already did its best; this
                                // backend will keep rejecting the shape.
                                return Err(TryBackendError::Advance(BackendFailure {
                                    backend: backend.clone(),
                                    class,
                                    message: e.to_string(),
                                }));
                            }
                            FailureClass::ClientError => {
                                let status = match &e {
                                    BackendError::Api { status, .. } => *status,
                                    _ => 400,
                                };
                                return Err(TryBackendError::Fatal(RouterError::Client {
                                    status,
                                    message: e.to_string(),
                                }));
                            }
                            FailureClass::Internal => {
                                return Err(TryBackendError::Advance(BackendFailure {
                                    backend: backend.clone(),
                                    class,
                                    message: e.to_string(),
                                }));
                            }
                        }
                    }
                }
            }
        }

        let (class, message) = last.unwrap_or((
            FailureClass::QuotaExhausted,
            "all credentials ineligible".into(),
        ));
        Err(TryBackendError::Advance(BackendFailure {
            backend: backend.clone(),
            class,
            message,
        }))
    }

    /// Backoff for in-place retries: honor upstream retry-after when given,
    /// exponential on the base delay otherwise.
    fn backoff(&self, err: &BackendError, attempt: u32) -> Duration {
        match err {
            BackendError::RateLimited { retry_after_ms, .. } => {
                Duration::from_millis((retry_after_ms + 200).min(10_000))
            }
            _ => Duration::from_millis(self.retry.retry_429_base_delay_ms << attempt),
        }
    }
}

enum TryBackendError {
    /// Move on to the next backend in the chain.
    Advance(BackendFailure),
    /// Stop the chain and surface this to the client.
    Fatal(RouterError),
}

/// Coarse model family, for signature compatibility and pool fallback.
pub fn model_family(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("claude") {
        "claude"
    } else if lower.starts_with("gemini") {
        "gemini"
    } else if lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
        "openai"
    } else {
        "other"
    }
}

/// Split a backend's declared models into same-family alternates and
/// cross-family candidates relative to `model`. Wildcard entries are skipped;
/// they do not name a concrete model to fall back to.
fn family_alternates(config: &BackendConfig, model: &str) -> (Vec<String>, Vec<String>) {
    let family = model_family(model);
    let mut same = Vec::new();
    let mut cross = Vec::new();
    for declared in &config.models {
        if declared.ends_with('*') || declared == model {
            continue;
        }
        if model_family(declared) == family {
            same.push(declared.clone());
        } else {
            cross.push(declared.clone());
        }
    }
    (same, cross)
}
