use crate::server::AdminState;
use axum::extract::State;
use axum::response::Json;
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn health_check(State(state): State<Arc<AdminState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "services": state.manager.local_state().len(),
        "central_config": state.central_config_enabled,
        "metrics": state.manager.metrics().is_enabled(),
    }))
}

/// Prometheus text exposition. Empty when metrics are disabled.
pub async fn metrics(State(state): State<Arc<AdminState>>) -> String {
    state.manager.metrics().render()
}
