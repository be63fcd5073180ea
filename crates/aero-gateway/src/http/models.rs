//! GET /v1/models — models derived from the configured backends.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::app::AppState;

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    // model -> owning backend, first (highest-priority) declaration wins.
    let mut models: BTreeMap<String, String> = BTreeMap::new();
    for slot in state.router.slots() {
        for model in &slot.config.models {
            if model.ends_with('*') {
                continue;
            }
            models
                .entry(model.clone())
                .or_insert_with(|| slot.config.key.clone());
        }
    }

    let data: Vec<Value> = models
        .into_iter()
        .map(|(id, backend)| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": backend,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}
