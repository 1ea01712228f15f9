//! Error types for the Cuaderno sync engine.
//!
//! [`Error`] covers everything that can go wrong locally (validation,
//! storage, state transitions). [`SyncError`] is the failure taxonomy of a
//! sync cycle talking to the remote endpoint; each variant knows whether it
//! is retryable and which [`FailureKind`] it leaves on an operation.

use crate::{OperationId, RecordId, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local engine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Lookup errors
    #[error("record not found: {table}/{id}")]
    RecordNotFound { table: TableName, id: RecordId },

    #[error("record already exists: {table}/{id}")]
    RecordAlreadyExists { table: TableName, id: RecordId },

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    // State machine errors
    #[error("invalid transition for operation {operation_id}: {reason}")]
    InvalidTransition {
        operation_id: OperationId,
        reason: String,
    },

    #[error("invalid conflict resolution: {0}")]
    InvalidResolution(String),

    #[error("no merge handler registered for table: {0}")]
    NoMergeHandler(TableName),

    #[error("sync in progress")]
    SyncInProgress,

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why an operation last failed.
///
/// Persisted on the operation so a restart still knows whether the failure
/// is retryable or needs a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Server,
    Validation,
    Conflict,
    Auth,
    ExhaustedRetries,
}

impl FailureKind {
    /// Whether the retry scheduler may pick the operation up again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Network | FailureKind::Server | FailureKind::Auth
        )
    }
}

/// Failures of a sync cycle or of a single remote call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Remote endpoint unreachable.
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its time bound.
    #[error("request timed out")]
    Timeout,

    /// 5xx response.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// 4xx response other than auth and conflict, or a malformed payload.
    #[error("validation error: {0}")]
    Validation(String),

    /// 409 response.
    #[error("conflict: {0}")]
    Conflict(String),

    /// 401/403 response, or no usable token.
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("operation {operation_id} exhausted its retries")]
    ExhaustedRetries { operation_id: OperationId },

    /// Connectivity does not allow a sync right now.
    #[error("not eligible to sync: {0}")]
    NotEligible(String),

    /// Another cycle holds the single-flight guard.
    #[error("sync already in progress")]
    InProgress,

    #[error(transparent)]
    Local(#[from] Error),
}

impl SyncError {
    /// Whether the failure is absorbed by retry/backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_)
            | SyncError::Timeout
            | SyncError::Server { .. }
            | SyncError::Auth(_) => true,
            SyncError::Validation(_)
            | SyncError::Conflict(_)
            | SyncError::ExhaustedRetries { .. }
            | SyncError::NotEligible(_)
            | SyncError::InProgress
            | SyncError::Local(_) => false,
        }
    }

    /// The failure recorded on operations that were in flight.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SyncError::Network(_) | SyncError::Timeout | SyncError::NotEligible(_) => {
                FailureKind::Network
            }
            SyncError::Server { .. } | SyncError::InProgress => FailureKind::Server,
            SyncError::Validation(_) | SyncError::Local(_) => FailureKind::Validation,
            SyncError::Conflict(_) => FailureKind::Conflict,
            SyncError::Auth(_) => FailureKind::Auth,
            SyncError::ExhaustedRetries { .. } => FailureKind::ExhaustedRetries,
        }
    }

    /// Classify a non-2xx HTTP status. 408 and 429 are transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => SyncError::Auth(message),
            408 => SyncError::Timeout,
            409 => SyncError::Conflict(message),
            429 => SyncError::Server { status, message },
            400..=499 => SyncError::Validation(message),
            _ => SyncError::Server { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::TableNotFound("parcelas".into());
        assert_eq!(err.to_string(), "table not found: parcelas");

        let err = Error::TypeMismatch {
            field: "superficie".into(),
            expected: "Float".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'superficie': expected Float, got String"
        );

        let err = SyncError::Server {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "server error (503): unavailable");
    }

    #[test]
    fn status_classification() {
        assert!(matches!(SyncError::from_status(401, ""), SyncError::Auth(_)));
        assert!(matches!(SyncError::from_status(403, ""), SyncError::Auth(_)));
        assert!(matches!(
            SyncError::from_status(409, ""),
            SyncError::Conflict(_)
        ));
        assert!(matches!(
            SyncError::from_status(422, ""),
            SyncError::Validation(_)
        ));
        assert!(matches!(
            SyncError::from_status(502, ""),
            SyncError::Server { status: 502, .. }
        ));
    }

    #[test]
    fn transient_client_statuses_are_retryable() {
        let timeout = SyncError::from_status(408, "request timeout");
        assert!(matches!(timeout, SyncError::Timeout));
        assert!(timeout.is_retryable());

        let throttled = SyncError::from_status(429, "slow down");
        assert!(matches!(throttled, SyncError::Server { status: 429, .. }));
        assert!(throttled.is_retryable());
        assert_eq!(throttled.failure_kind(), FailureKind::Server);
    }

    #[test]
    fn retryability() {
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Network("down".into()).is_retryable());
        assert!(SyncError::Auth("expired".into()).is_retryable());
        assert!(!SyncError::Validation("bad".into()).is_retryable());
        assert!(!SyncError::Conflict("stale".into()).is_retryable());

        assert!(SyncError::Timeout.failure_kind().is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::ExhaustedRetries.is_retryable());
        assert!(!FailureKind::Conflict.is_retryable());
    }
}
