use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = &state.engine;
    let recorder = engine.recorder();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "store": state.store_name,
        "providers": engine.providers().names(),
        "default_provider": engine.config().generation.default_provider,
        "templates": engine.templates().names().collect::<Vec<_>>(),
        "metrics": {
            "written": recorder.written(),
            "dropped": recorder.dropped(),
            "failed": recorder.failed(),
        }
    }))
}
