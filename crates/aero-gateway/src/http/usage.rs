//! GET /usage — aggregated token usage (JSON only; the panel UI ships
//! separately).

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct UsageQuery {
    /// Look-back window in hours (default 24).
    #[serde(default = "default_hours")]
    hours: u32,
}

fn default_hours() -> u32 {
    24
}

pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(usage) = &state.usage else {
        return Err(StatusCode::NOT_FOUND);
    };
    let since = chrono::Utc::now().timestamp() - (query.hours as i64) * 3_600;
    let totals = usage
        .totals_since(since)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({
        "hours": query.hours,
        "models": totals,
    })))
}
