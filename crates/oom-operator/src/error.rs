//! Error types for the OOM operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Write rejected because the caller held a stale resource version
    #[error("Conflicting write to {kind}/{name} in namespace {namespace}: resource version is stale")]
    Conflict {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Create rejected because the object is already present
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Store backend failure that is not an API error (transport, injected faults)
    #[error("Store error: {0}")]
    StoreError(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::KubeError(_)
                | OperatorError::Conflict { .. }
                | OperatorError::AlreadyExists { .. }
                | OperatorError::StoreError(_)
        )
    }

    /// Whether the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict { .. } => true,
            OperatorError::KubeError(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Get a suggested requeue delay for retryable errors
    ///
    /// Conflicts are retried quickly since a fresh read usually resolves them.
    pub fn requeue_delay(&self) -> Option<Duration> {
        if self.is_conflict() {
            Some(Duration::from_secs(1))
        } else {
            None
        }
    }
}
