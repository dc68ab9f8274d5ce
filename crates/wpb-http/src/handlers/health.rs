use axum::{extract::State, response::Json};
use serde_json::{json, Value};

use crate::router::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
        "sessions": state.service.session_count(),
    }))
}
