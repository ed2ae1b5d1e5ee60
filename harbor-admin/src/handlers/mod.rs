pub mod health;
pub mod services;

use axum::response::Json;
use http::StatusCode;
use serde_json::{Value, json};

/// JSON error response with the given status code.
pub(crate) fn error_response(code: u16, message: impl ToString) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({"error": message.to_string(), "status": status.as_u16()})),
    )
}
