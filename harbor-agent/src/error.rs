use crate::persist::PersistError;
use harbor_core::HarborError;
use thiserror::Error;

/// Errors surfaced by the service manager.
///
/// Watch failures never appear here: they are retried inside the watchers.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Validation(#[from] HarborError),

    /// The in-memory publish already happened; only disk lags behind.
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("service manager is shutting down")]
    ShuttingDown,
}

impl ManagerError {
    pub fn status_code(&self) -> u16 {
        match self {
            ManagerError::Validation(e) => e.status_code(),
            ManagerError::Persist(_) => 500,
            ManagerError::ShuttingDown => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let invalid = ManagerError::from(HarborError::Validation("no name".into()));
        assert_eq!(invalid.status_code(), 400);
        assert_eq!(ManagerError::ShuttingDown.status_code(), 503);
        assert_eq!(invalid.to_string(), "Invalid service registration: no name");
    }
}
