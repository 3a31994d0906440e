//! Error types for the outbox engine.

use thiserror::Error;

/// Boxed source for backend failures that do not come from sqlx.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A create command that cannot be turned into an event.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("idempotency key must not be empty")]
    EmptyIdempotencyKey,

    #[error("payload must not be empty")]
    EmptyPayload,
}

/// Event store error type.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A unique constraint rejected the write, normally a duplicate idempotency key.
    #[error("constraint violation{}", .constraint.as_deref().map(|c| format!(" on {c}")).unwrap_or_default())]
    ConstraintViolation { constraint: Option<String> },

    /// The backend could not be reached.
    #[error("event store unavailable: {0}")]
    Unavailable(#[source] BoxError),

    /// The backend was reached but the statement failed.
    #[error("event store query failed: {0}")]
    Query(#[source] BoxError),
}

impl StoreError {
    pub fn unavailable(err: impl Into<BoxError>) -> Self {
        Self::Unavailable(err.into())
    }

    pub fn query(err: impl Into<BoxError>) -> Self {
        Self::Query(err.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::ConstraintViolation {
                    constraint: db_err.constraint().map(str::to_owned),
                };
            }
        }

        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(Box::new(err)),
            other => Self::Query(Box::new(other)),
        }
    }
}

/// Broker publish error type. Always scoped to a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The broker answered and refused the message.
    #[error("broker rejected message ({code}): {message}")]
    Rejected { code: String, message: String },

    /// The broker could not be reached or the call failed in transit.
    #[error("broker transport failure: {0}")]
    Transport(String),

    /// The payload cannot be carried by the broker.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidPayload(#[from] std::str::Utf8Error),

    /// The request for the broker could not be built.
    #[error("invalid broker request: {0}")]
    InvalidRequest(String),
}

/// Invalid engine settings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("invalid command: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid command at index {index}: {source}")]
    InvalidBatchCommand {
        index: usize,
        #[source]
        source: ValidationError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OutboxError {
    /// True when the store refused a duplicate idempotency key.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::Store(StoreError::ConstraintViolation { .. }))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable(_)))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_names_constraint() {
        let err = StoreError::ConstraintViolation {
            constraint: Some("events_idempotency_key_key".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "constraint violation on events_idempotency_key_key"
        );

        let err = StoreError::ConstraintViolation { constraint: None };
        assert_eq!(err.to_string(), "constraint violation");
    }

    #[test]
    fn pool_errors_are_unavailable() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Query(_)
        ));
    }

    #[test]
    fn outbox_error_classification() {
        let dup = OutboxError::from(StoreError::ConstraintViolation { constraint: None });
        assert!(dup.is_constraint_violation());
        assert!(!dup.is_unavailable());

        let down = OutboxError::from(StoreError::unavailable("connection refused"));
        assert!(down.is_unavailable());
    }
}
