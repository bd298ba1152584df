//! Error taxonomy shared across the controller.
//!
//! Component boundaries convert lower-layer failures into one of these
//! kinds; the scheduler's retry engine acts only on [`Error::Transient`].

use thiserror::Error;

/// Classified error for controller operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input shape or parameters out of range. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate key or a stale status precondition. Callers may re-read
    /// and retry internally.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network timeout, DNS transient, or store transient. Retried with
    /// backoff; tasks hitting this class consume retry budget.
    #[error("transient error: {0}")]
    Transient(String),

    /// Non-retryable worker error, dependency failure, or exhausted retry
    /// budget. Terminal for the task.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Programmer error or invariant violation. Logged, surfaced as an
    /// opaque internal error, never retried.
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl Error {
    /// Whether the scheduler's retry engine may act on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Short machine-readable code for user-visible surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of an error reported by a worker alongside a failed task.
///
/// `Transient` and `Timeout` trigger retry while budget remains;
/// `Validation` and `Permanent` terminate the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorClass {
    Transient,
    Timeout,
    Validation,
    Permanent,
}

impl WorkerErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl std::fmt::Display for WorkerErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(Error::Transient("dns".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Conflict("stale".into()).is_retryable());
        assert!(!Error::Permanent("budget".into()).is_retryable());
        assert!(!Error::Internal(anyhow::anyhow!("bug")).is_retryable());
    }

    #[test]
    fn worker_error_class_retryability() {
        assert!(WorkerErrorClass::Transient.is_retryable());
        assert!(WorkerErrorClass::Timeout.is_retryable());
        assert!(!WorkerErrorClass::Validation.is_retryable());
        assert!(!WorkerErrorClass::Permanent.is_retryable());
    }

    #[test]
    fn internal_error_message_is_opaque() {
        let err = Error::Internal(anyhow::anyhow!("secret database password leaked"));
        assert_eq!(err.to_string(), "internal error");
    }
}
