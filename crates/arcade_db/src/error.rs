//! Error types for the storage layer.

use thiserror::Error;

use crate::types::{CancellationReason, ItemKey};

/// Storage operation result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLx error (connection, query, etc.)
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Item body could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A transactional write was rejected as a whole. One reason per operation,
    /// in submission order.
    #[error("Transaction cancelled: {}", format_reasons(.reasons))]
    TransactionCanceled { reasons: Vec<CancellationReason> },

    /// A single-item conditional write failed its condition
    #[error("Condition failed for item {key}")]
    ConditionFailed { key: ItemKey },

    /// Malformed request (missing key attributes, duplicate keys in a transaction, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Table name rejected before it reached any SQL
    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    /// Unsupported or malformed store URL
    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),

    /// Backend refused the call for a transient reason
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// True for the structured cancellation a concurrent writer can cause.
    pub fn is_transaction_canceled(&self) -> bool {
        matches!(self, Self::TransactionCanceled { .. })
    }
}

fn format_reasons(reasons: &[CancellationReason]) -> String {
    let parts: Vec<String> = reasons.iter().map(|r| r.to_string()).collect();
    format!("[{}]", parts.join(", "))
}
