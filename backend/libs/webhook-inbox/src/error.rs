//! Error types for the webhook inbox library

use thiserror::Error;
use uuid::Uuid;

/// Result type for inbox operations
pub type InboxResult<T> = Result<T, InboxError>;

/// Errors that can occur while storing or claiming inbox entries
#[derive(Error, Debug)]
pub enum InboxError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event ID validation failed (empty, too long)
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),

    /// Entry does not exist
    #[error("Inbox entry not found: {0}")]
    NotFound(Uuid),

    /// A stored row could not be mapped back into an entry
    #[error("Corrupt inbox row: {0}")]
    Corrupt(String),

    /// JSON serialization/deserialization error for payloads
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl InboxError {
    /// Check if error is a duplicate key violation.
    ///
    /// Enqueue uses `ON CONFLICT DO NOTHING`, so this only surfaces from
    /// hand-written inserts against the same table.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            InboxError::Database(sqlx_err) => sqlx_err
                .as_database_error()
                .and_then(|db_err| db_err.code())
                .map(|code| code == "23505")
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Check if error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        match self {
            InboxError::Database(sqlx_err) => matches!(
                sqlx_err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}
