//! Error types for the resource store.

use arcade_db::{CancellationReason, StoreError};
use thiserror::Error;

/// Resource operation result type.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Resource store errors.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The addressed resource does not exist
    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    /// The caller asked for something that can never succeed as phrased
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request conflicts with the current state of the store
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A transactional write was still cancelled after every retry
    #[error("Database transaction failed: {}", format_reasons(.reasons))]
    DatabaseTransaction { reasons: Vec<CancellationReason> },

    /// Unclassified storage failure, passed through unchanged
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResourceError {
    /// Create a not-found error.
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn format_reasons(reasons: &[CancellationReason]) -> String {
    let failed: Vec<String> = reasons
        .iter()
        .filter(|r| r.is_failure())
        .map(|r| r.to_string())
        .collect();
    format!("[{}]", failed.join(", "))
}
