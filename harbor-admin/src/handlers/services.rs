use super::error_response;
use crate::server::AdminState;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use harbor_agent::RegistrationSource;
use harbor_core::{HarborError, ServiceRegistration};
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

/// Header carrying the registration token.
pub const TOKEN_HEADER: &str = "x-harbor-token";

#[derive(Debug, Default, Deserialize)]
pub struct RegisterParams {
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub token: Option<String>,
}

/// PUT /v1/agent/service/register
pub async fn register_service(
    State(state): State<Arc<AdminState>>,
    Query(params): Query<RegisterParams>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let registration: ServiceRegistration = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            let err = HarborError::from(e);
            return (StatusCode::BAD_REQUEST, Json(err.to_json_body()));
        }
    };
    let id = if registration.id.is_empty() {
        registration.service.clone()
    } else {
        registration.id.clone()
    };

    // header wins over the query parameter
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(params.token)
        .unwrap_or_default();

    match state
        .manager
        .register(registration, params.persist, &token, RegistrationSource::Remote)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"id": id, "status": "registered"})),
        ),
        Err(e) => {
            warn!(service_id = %id, error = %e, "Service registration failed");
            error_response(e.status_code(), e)
        }
    }
}

/// PUT /v1/agent/service/deregister/:id
pub async fn deregister_service(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.manager.deregister(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"id": id, "deregistered": true}))),
        Err(e) => error_response(e.status_code(), e),
    }
}

/// GET /v1/agent/service/:id
pub async fn get_service(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.manager.service(&id) {
        Some(s) => (StatusCode::OK, Json(json!(s))),
        None => (
            StatusCode::NOT_FOUND,
            Json(HarborError::ServiceNotFound(id).to_json_body()),
        ),
    }
}

/// GET /v1/agent/services
pub async fn list_services(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let services = state.manager.services();
    Json(json!({"list": services, "total": services.len()}))
}
