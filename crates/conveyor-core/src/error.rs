//! Error taxonomy for Conveyor.
//!
//! Every externally visible failure maps to exactly one of these kinds.
//! `Transport` and `OptimisticLock` are retriable by callers; the rest are
//! surfaced unmodified.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// Deliberately carries no detail: an unauthorized caller must not
    /// learn whether the resource exists.
    #[error("unauthorized")]
    Unauthorized,

    #[error("account disabled: {0}")]
    AccountDisabled(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("invalid status transition: {0}")]
    FsmInvalid(String),

    #[error("stale etag on {0}")]
    OptimisticLock(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("log is sealed: {0}")]
    LogClosed(String),

    #[error("dependency cycle: {0}")]
    Cycle(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Whether a caller is expected to retry the operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::OptimisticLock(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(Error::Transport("io".into()).is_retriable());
        assert!(Error::OptimisticLock("job".into()).is_retriable());
        assert!(!Error::FsmInvalid("queued -> succeeded".into()).is_retriable());
        assert!(!Error::Unauthorized.is_retriable());
    }

    #[test]
    fn unauthorized_discloses_nothing() {
        assert_eq!(Error::Unauthorized.to_string(), "unauthorized");
    }
}
