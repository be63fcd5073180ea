//! GET /health — gateway and backend status snapshot.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime_secs: i64,
    backends: Vec<BackendHealth>,
    upstream: Vec<aero_backend::BackendHealthEntry>,
    cache: aero_cache::StoreStats,
    conversations: usize,
}

#[derive(Serialize)]
struct BackendHealth {
    key: String,
    format: &'static str,
    priority: i32,
    credentials: usize,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let backends = state
        .router
        .slots()
        .iter()
        .map(|slot| BackendHealth {
            key: slot.config.key.clone(),
            format: slot.config.api_format.as_str(),
            priority: slot.config.priority,
            credentials: state.credentials.pool_size(&slot.config.key),
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        uptime_secs: chrono::Utc::now().timestamp() - state.started_at,
        backends,
        upstream: state.router.health().all_entries(),
        cache: state.store.stats(),
        conversations: state.conversations.len(),
    })
}
