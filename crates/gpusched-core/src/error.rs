//! Error types for gpusched

use thiserror::Error;

/// Main error type for gpusched
#[derive(Error, Debug)]
pub enum SchedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Referenced GpuClaim does not exist
    #[error("Claim not found: {0}")]
    ClaimNotFound(String),

    /// GpuClaim failed validation
    #[error("Claim invalid: {0}")]
    ClaimInvalid(String),

    /// Transient cluster store error
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpusched operations
pub type SchedResult<T> = Result<T, SchedError>;

impl From<kube::Error> for SchedError {
    fn from(err: kube::Error) -> Self {
        SchedError::Store(err.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization(err.to_string())
    }
}
