use thiserror::Error;

/// Unified error type for Harbor.
#[derive(Error, Debug)]
pub enum HarborError {
    #[error("Invalid service registration: {0}")]
    Validation(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl HarborError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            HarborError::Validation(_) => 400,
            HarborError::Serde(_) => 400,
            HarborError::ServiceNotFound(_) => 404,
            HarborError::Config(_) => 500,
        }
    }

    /// JSON error body.
    pub fn to_json_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "status": self.status_code(),
        })
    }
}
