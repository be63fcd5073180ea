use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tracing::{info, warn};

use aero_auth::{Credential, CredentialManager};
use aero_backend::adapter::BackendAdapter;
use aero_backend::{BackendRouter, RouterSlot};
use aero_cache::mirror::SignatureMirror;
use aero_cache::SignatureStore;
use aero_core::config::{AeroConfig, ApiFormat};
use aero_state::{ConversationManager, UsageRecorder};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: AeroConfig,
    pub store: Arc<SignatureStore>,
    pub credentials: Arc<CredentialManager>,
    pub conversations: Arc<ConversationManager>,
    pub usage: Option<Arc<UsageRecorder>>,
    pub router: BackendRouter,
    pub started_at: i64,
}

impl AppState {
    pub fn build(config: AeroConfig) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(&config.storage.data_dir);

        let mirror = if config.cache.mirror {
            std::fs::create_dir_all(&data_dir)?;
            match SignatureMirror::open(&data_dir.join("signatures.db")) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(error = %e, "signature mirror unavailable, running memory-only");
                    None
                }
            }
        } else {
            None
        };
        let store = Arc::new(SignatureStore::new(config.cache.max_entries, mirror));

        let credentials = Arc::new(CredentialManager::new(
            config.retry.quota_floor,
            config.retry.default_cooldown_secs,
            config.retry.calls_per_rotation,
            config.auto_ban,
        ));

        let mut slots = Vec::new();
        for backend in &config.backends {
            if !backend.enabled {
                continue;
            }
            let proxy = outbound_proxy(&config, backend.api_format);
            let adapter: Arc<dyn BackendAdapter> = match backend.api_format {
                ApiFormat::Anthropic => Arc::new(
                    aero_backend::anthropic::AnthropicAdapter::new(backend, proxy)
                        .map_err(|e| anyhow::anyhow!("backend {}: {e}", backend.key))?,
                ),
                ApiFormat::OpenAi => Arc::new(
                    aero_backend::openai::OpenAiAdapter::new(backend, proxy)
                        .map_err(|e| anyhow::anyhow!("backend {}: {e}", backend.key))?,
                ),
                ApiFormat::Gemini => Arc::new(
                    aero_backend::gemini::GeminiAdapter::new(backend, proxy)
                        .map_err(|e| anyhow::anyhow!("backend {}: {e}", backend.key))?,
                ),
            };

            for (i, key) in backend.api_keys.iter().enumerate() {
                credentials.register(
                    &backend.key,
                    Credential::from_api_key(format!("{}-key-{i}", backend.key), key.clone()),
                );
            }
            let identity_dir = data_dir.join("identities").join(&backend.key);
            for credential in aero_auth::refresh::load_identity_dir(&identity_dir) {
                credentials.register(&backend.key, credential);
            }

            info!(
                backend = %backend.key,
                format = backend.api_format.as_str(),
                credentials = credentials.pool_size(&backend.key),
                "backend registered"
            );
            slots.push(RouterSlot {
                adapter,
                config: backend.clone(),
            });
        }

        let refresh_client = build_refresh_client(&config);
        let router = BackendRouter::new(
            slots,
            config.routes.clone(),
            credentials.clone(),
            config.retry.clone(),
            refresh_client,
        );

        let conversations = if config.conversation.persist {
            std::fs::create_dir_all(&data_dir)?;
            let conn = rusqlite::Connection::open(data_dir.join("conversations.db"))?;
            Arc::new(
                ConversationManager::new(config.conversation.idle_ttl_secs, Some(conn))
                    .map_err(|e| anyhow::anyhow!("conversations.db: {e}"))?,
            )
        } else {
            Arc::new(ConversationManager::in_memory(
                config.conversation.idle_ttl_secs,
            ))
        };

        let usage = match std::fs::create_dir_all(&data_dir)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                UsageRecorder::open(&data_dir.join("usage.db")).map_err(anyhow::Error::from)
            }) {
            Ok(u) => Some(Arc::new(u)),
            Err(e) => {
                warn!(error = %e, "usage accounting unavailable");
                None
            }
        };

        Ok(Self {
            config,
            store,
            credentials,
            conversations,
            usage,
            router,
            started_at: chrono::Utc::now().timestamp(),
        })
    }
}

/// Token-endpoint client; the OAuth proxy override wins over the general
/// outbound proxy.
fn build_refresh_client(config: &AeroConfig) -> reqwest::Client {
    let proxy = config
        .outbound
        .oauth_proxy
        .as_deref()
        .or(config.outbound.proxy.as_deref());
    let mut builder = reqwest::Client::builder();
    if let Some(proxy) = proxy {
        match reqwest::Proxy::all(proxy) {
            Ok(p) => builder = builder.proxy(p),
            Err(e) => warn!(proxy, error = %e, "invalid oauth proxy, ignoring"),
        }
    }
    builder.build().unwrap_or_default()
}

/// Pick the outbound proxy for a backend: the Gemini override wins for that
/// family, then the general proxy.
fn outbound_proxy(config: &AeroConfig, format: ApiFormat) -> Option<&str> {
    match format {
        ApiFormat::Gemini => config
            .outbound
            .googleapis_proxy
            .as_deref()
            .or(config.outbound.proxy.as_deref()),
        _ => config.outbound.proxy.as_deref(),
    }
}

/// Periodic sweep of expired cache entries and conversations.
pub fn spawn_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let signatures = state.store.cleanup_expired();
            let conversations = state.conversations.sweep_expired();
            if signatures > 0 || conversations > 0 {
                info!(signatures, conversations, "expired state swept");
            }
        }
    });
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/usage", get(crate::http::usage::usage_handler))
        .route("/v1/models", get(crate::http::models::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::http::openai::chat_completions),
        )
        .route("/v1/messages", post(crate::http::anthropic::messages))
        .route(
            "/v1/models/{model_action}",
            post(crate::http::gemini::generate_content),
        )
        .route("/v1/chat-stream", post(crate::http::ndjson::chat_stream))
        // Direct-addressed variants pin the chain to one backend.
        .route(
            "/{backend}/v1/chat/completions",
            post(crate::http::openai::chat_completions_for_backend),
        )
        .route(
            "/{backend}/v1/messages",
            post(crate::http::anthropic::messages_for_backend),
        )
        .route(
            "/{backend}/v1/models/{model_action}",
            post(crate::http::gemini::generate_content_for_backend),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
