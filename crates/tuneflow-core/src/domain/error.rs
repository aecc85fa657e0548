//! Domain-level error taxonomy for Tuneflow.

use crate::retry::RetryError;
use crate::serving::ServingError;

/// Tuneflow domain errors.
#[derive(Debug, thiserror::Error)]
pub enum TuneflowError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("{operation} exhausted retries after {attempts} attempt(s): {last_error}")]
    ExhaustedRetries {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("secret {name} not found in namespace {namespace}")]
    SecretNotFound { name: String, namespace: String },

    #[error("secret {secret} is missing field {field}")]
    SecretFieldMissing { secret: String, field: String },

    #[error("serving error: {0}")]
    Serving(#[from] ServingError),

    #[error("no candidate produced a score report")]
    NoCandidates,

    #[error("candidate not found: {0}")]
    CandidateNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid benchmark data: {0}")]
    InvalidBenchmark(String),

    #[error("report error: {0}")]
    Reporting(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TuneflowError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TuneflowError::TransientNetwork(_))
    }
}

impl<E: std::fmt::Display> From<RetryError<E>> for TuneflowError {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted {
                operation,
                attempts,
                last_error,
            } => TuneflowError::ExhaustedRetries {
                operation,
                attempts,
                last_error: last_error.to_string(),
            },
        }
    }
}

/// Result type for Tuneflow domain operations.
pub type Result<T> = std::result::Result<T, TuneflowError>;
