/// Error types for payment-service
///
/// Errors fall into three groups: validation (caller-fixable, 4xx, never
/// retried), processor (timeouts, outages, declines) and integrity
/// (ledger invariants that were about to be violated). Integrity errors are
/// logged at error level and counted before they reach the caller.
use crate::metrics;
use crate::processors::ProcessorError;
use crate::repository::StoreError;
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("Refund window expired: transactions can be refunded within {days} days")]
    RefundWindowExpired { days: i64 },

    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Inbox error: {0}")]
    Inbox(#[from] webhook_inbox::InboxError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Build an integrity error, logging and counting it on the way out
    pub fn integrity(operation: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(operation = operation, error = %message, "Ledger integrity violation");
        metrics::record_integrity_error(operation);
        ServiceError::Integrity(message)
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation(_)
                | ServiceError::InsufficientBalance { .. }
                | ServiceError::RefundWindowExpired { .. }
                | ServiceError::UnknownProcessor(_)
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, ServiceError::Integrity(_))
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Processor(e) => e.is_transient(),
            ServiceError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            ServiceError::Inbox(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// JSON error body shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_)
            | ServiceError::InsufficientBalance { .. }
            | ServiceError::RefundWindowExpired { .. } => StatusCode::BAD_REQUEST,
            ServiceError::UnknownProcessor(_) | ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Conflict(_) | ServiceError::Integrity(_) => StatusCode::CONFLICT,
            ServiceError::Processor(e) => match e {
                ProcessorError::Declined(_) => StatusCode::PAYMENT_REQUIRED,
                ProcessorError::SignatureInvalid | ProcessorError::MalformedPayload(_) => {
                    StatusCode::BAD_REQUEST
                }
                ProcessorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                ProcessorError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            ServiceError::Database(_) | ServiceError::Inbox(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error_type, code) = match self {
            ServiceError::Validation(_) => ("validation_error", "VALIDATION_ERROR"),
            ServiceError::InsufficientBalance { .. } => {
                ("validation_error", "INSUFFICIENT_BALANCE")
            }
            ServiceError::RefundWindowExpired { .. } => {
                ("validation_error", "REFUND_WINDOW_EXPIRED")
            }
            ServiceError::UnknownProcessor(_) => ("not_found_error", "UNKNOWN_PROCESSOR"),
            ServiceError::NotFound(_) => ("not_found_error", "NOT_FOUND"),
            ServiceError::Unauthorized(_) => ("authentication_error", "UNAUTHORIZED"),
            ServiceError::Forbidden(_) => ("authorization_error", "FORBIDDEN"),
            ServiceError::Conflict(_) => ("conflict_error", "CONFLICT"),
            ServiceError::Integrity(_) => ("integrity_error", "LEDGER_INTEGRITY"),
            ServiceError::Processor(ProcessorError::Declined(_)) => {
                ("processor_error", "PAYMENT_DECLINED")
            }
            ServiceError::Processor(ProcessorError::SignatureInvalid) => {
                ("authentication_error", "INVALID_SIGNATURE")
            }
            ServiceError::Processor(_) => ("processor_error", "PROCESSOR_ERROR"),
            ServiceError::Database(_) => ("server_error", "DATABASE_ERROR"),
            ServiceError::Inbox(_) | ServiceError::Internal(_) => {
                ("server_error", "INTERNAL_SERVER_ERROR")
            }
        };

        // Server-side details stay in the logs
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, "Request failed with internal error");
                "An internal error occurred".to_string()
            }
            _ => self.to_string(),
        };

        let response = ErrorResponse::new(
            status.canonical_reason().unwrap_or("Error"),
            &message,
            status.as_u16(),
            error_type,
            code,
        );

        HttpResponse::build(status).json(response)
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::InsufficientBalance {
                available,
                requested,
            } => ServiceError::InsufficientBalance {
                available,
                requested,
            },
            StoreError::StatusConflict { entity, id, status } => ServiceError::integrity(
                "status_transition",
                format!("{} {} is already {}", entity, id, status),
            ),
            StoreError::ProcessorReferenceConflict {
                processor_transaction_id,
                existing,
            } => ServiceError::integrity(
                "processor_reference",
                format!(
                    "processor transaction {} already belongs to transaction {}",
                    processor_transaction_id, existing
                ),
            ),
            StoreError::Conflict(message) => ServiceError::Conflict(message),
            StoreError::VersionConflict(id) => {
                ServiceError::Conflict(format!("subscription {} was modified concurrently", id))
            }
            StoreError::Database(e) => ServiceError::Database(e),
            StoreError::Corrupt(message) => ServiceError::Internal(message),
        }
    }
}

impl From<crate::domain::ParseEnumError> for ServiceError {
    fn from(err: crate::domain::ParseEnumError) -> Self {
        ServiceError::Validation(err.to_string())
    }
}
