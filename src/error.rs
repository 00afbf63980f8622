//! Error types for the flowhub system.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowhubError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("lock not acquired: {0}")]
    LockNotAcquired(String),
    #[error("asset missing: {0}")]
    AssetMissing(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("service error: {0}")]
    Service(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("task timed out after {0} seconds")]
    TaskTimeout(u64),
    #[error("{1}: {0}")]
    Wrapped(Box<FlowhubError>, String),
}

impl FlowhubError {
    /// Wraps this error with a context string, preserving the cause chain
    /// so workers can log the full causality trace.
    pub fn wrap(self, context: impl Into<String>) -> FlowhubError {
        FlowhubError::Wrapped(Box::new(self), context.into())
    }

    /// The outermost sentence only, suitable for HTTP responses.
    pub fn outermost(&self) -> String {
        match self {
            FlowhubError::Wrapped(_, context) => context.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error should never be retried by the queue.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FlowhubError::Validation(_) | FlowhubError::Configuration(_)
        )
    }
}

impl From<serde_json::Error> for FlowhubError {
    fn from(err: serde_json::Error) -> Self {
        FlowhubError::Validation(format!("JSON error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, FlowhubError>;

/// How a lookup of an org asset that no longer exists is treated. Request
/// handlers surface the error, background jobs skip the work, and a few
/// invariant checks panic because a miss means a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingAssetPolicy {
    Panic,
    Error,
    Ignore,
}

/// Extension adding `.wrap_err("context")` to results carrying our error,
/// so call sites read like the causality chain they produce.
pub trait WrapErr<T> {
    fn wrap_err(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<FlowhubError>> WrapErr<T> for std::result::Result<T, E> {
    fn wrap_err(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().wrap(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_traces_causality() {
        let err = FlowhubError::Validation("no such field".to_string())
            .wrap("error applying pre commit hook: commit_messages");

        assert_eq!(
            err.to_string(),
            "error applying pre commit hook: commit_messages: validation error: no such field"
        );
        assert_eq!(
            err.outermost(),
            "error applying pre commit hook: commit_messages"
        );
    }

    #[test]
    fn validation_errors_are_permanent() {
        assert!(FlowhubError::Validation("bad json".into()).is_permanent());
        assert!(!FlowhubError::Queue("hiccup".into()).is_permanent());
    }
}
