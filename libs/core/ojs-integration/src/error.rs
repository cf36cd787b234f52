//! Error types for handler registration, job execution and backend calls.

use std::any::Any;
use thiserror::Error;

/// Error raised when a handler cannot be added to a worker's dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The resolved job type was empty at the point of registration.
    #[error("invalid registration: job type must not be empty")]
    EmptyJobType,
}

/// Error produced while executing a job.
///
/// Middleware must propagate these unchanged after doing its bookkeeping; the
/// worker engine decides what a failure means for retries.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Job arguments did not have the shape the handler expected.
    #[error("invalid job arguments: {0}")]
    InvalidArgs(#[from] serde_json::Error),

    /// The handler observed cancellation and stopped early.
    #[error("job {job_id} was cancelled")]
    Cancelled { job_id: String },

    /// The dispatch table has no entry for the fetched job's type.
    #[error("no handler registered for job type '{0}'")]
    UnknownJobType(String),

    /// The handler panicked. Carries the panic payload rendered as text.
    #[error("job handler '{job_type}' panicked: {payload}")]
    Panicked { job_type: String, payload: String },

    /// A backend call made from inside the handler failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl HandlerError {
    /// Create a plain handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler failure wrapping an underlying error.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Convert a caught panic payload into a typed failure.
    pub fn panicked(job_type: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        let payload = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self::Panicked {
            job_type: job_type.into(),
            payload,
        }
    }

    /// Whether this failure came from a caught panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}

/// Error returned by a [`JobQueueClient`](crate::JobQueueClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The backend could not be reached or answered with a server error.
    #[error("job queue backend unavailable: {0}")]
    Unavailable(String),

    /// The referenced job does not exist.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The backend refused the request (validation, duplicate, ...).
    #[error("request rejected by backend: {0}")]
    Rejected(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_panicked_from_str_payload() {
        let err = HandlerError::panicked("report.generate", Box::new("boom"));
        assert!(err.is_panic());
        assert_eq!(err.to_string(), "job handler 'report.generate' panicked: boom");
    }

    #[test]
    fn test_panicked_from_string_payload() {
        let err = HandlerError::panicked("t", Box::new(String::from("index out of range")));
        assert!(err.to_string().ends_with("index out of range"));
    }

    #[test]
    fn test_panicked_from_opaque_payload() {
        let err = HandlerError::panicked("t", Box::new(42_u32));
        assert!(err.to_string().contains("non-string panic payload"));
    }

    #[test]
    fn test_failed_keeps_message_and_source() {
        let io = std::io::Error::other("disk full");
        let err = HandlerError::with_source("could not write report", io);
        assert_eq!(err.to_string(), "could not write report");
        assert_eq!(err.source().unwrap().to_string(), "disk full");
        assert!(!err.is_panic());
    }

    #[test]
    fn test_client_error_is_transparent() {
        let err: HandlerError = ClientError::Unavailable("connection refused".into()).into();
        assert_eq!(
            err.to_string(),
            "job queue backend unavailable: connection refused"
        );
    }

    #[test]
    fn test_registration_error_message() {
        assert_eq!(
            RegistrationError::EmptyJobType.to_string(),
            "invalid registration: job type must not be empty"
        );
    }
}
