//! Error types for the pool, the attempt executors and the proxy source.
//!
//! None of these reach the caller of `RequestScheduler::solve`: attempt-level
//! failures are folded into `AttemptResult`/`SolveOutcome` by the orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::InfraErrorKind;

/// Errors returned by `ProxyPool` selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No proxy is Alive, idle and out of its ban cooldown.
    #[error("no proxy available")]
    NoProxyAvailable,
}

/// Errors raised by an `AttemptExecutor` instead of a classified result.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("solver binary '{0}' not found")]
    NotFound(String),

    #[error("failed to start solver: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("solver I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("solver exited without reporting a status ({0})")]
    NoResult(String),

    #[error("solver reported unknown status '{0}'")]
    UnknownStatus(String),

    #[error("attempt aborted: {0}")]
    Aborted(String),
}

impl ExecutorError {
    /// Classification used when the orchestrator folds this error into
    /// `AttemptResult::InfraError`.
    pub fn kind(&self) -> InfraErrorKind {
        match self {
            ExecutorError::NotFound(_) | ExecutorError::Spawn(_) => InfraErrorKind::Spawn,
            ExecutorError::Io(_) => InfraErrorKind::Crash,
            ExecutorError::NoResult(_) | ExecutorError::UnknownStatus(_) => InfraErrorKind::Protocol,
            ExecutorError::Aborted(_) => InfraErrorKind::Cancelled,
        }
    }
}

/// Errors from fetching or parsing a proxy list.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid proxy source URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to fetch proxy list: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to read proxy list {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy source returned no usable entries")]
    Empty,
}

/// Errors from building a `SolveRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("missing sitekey")]
    MissingSiteKey,

    #[error("invalid pageurl '{0}'")]
    InvalidPageUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_error_kinds() {
        assert_eq!(ExecutorError::NotFound("solver".into()).kind(), InfraErrorKind::Spawn);
        assert_eq!(ExecutorError::NoResult("exit 1".into()).kind(), InfraErrorKind::Protocol);
        assert_eq!(ExecutorError::Aborted("deadline".into()).kind(), InfraErrorKind::Cancelled);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(ExecutorError::Io(io).kind(), InfraErrorKind::Crash);
    }

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::NoProxyAvailable.to_string(), "no proxy available");
    }
}
