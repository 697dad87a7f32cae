use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use super::router::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let total = state.registry.list_streams().await.len();
    let active = state.registry.active_stream_count().await;

    Json(json!({
        "status": "healthy",
        "total_streams": total,
        "active_streams": active,
        "timestamp": Utc::now(),
    }))
}
