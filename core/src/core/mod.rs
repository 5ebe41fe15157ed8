pub mod clock;
pub mod gate;
pub mod orchestrator;
pub mod proxy_pool;
pub mod retry;
pub mod scheduler;
pub mod state;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RequestError;

/// Classification of execution-layer failures. Every kind is retried the
/// same way; the distinction is for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraErrorKind {
    PageLoad,
    Timeout,
    Crash,
    Spawn,
    Protocol,
    Cancelled,
    Other,
}

impl InfraErrorKind {
    /// Maps a solver-reported error kind onto the taxonomy. Unknown names fall
    /// back to `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "page_load" | "pageload" | "page" => InfraErrorKind::PageLoad,
            "timeout" => InfraErrorKind::Timeout,
            "crash" => InfraErrorKind::Crash,
            "spawn" => InfraErrorKind::Spawn,
            "protocol" => InfraErrorKind::Protocol,
            "cancelled" | "canceled" => InfraErrorKind::Cancelled,
            _ => InfraErrorKind::Other,
        }
    }
}

impl std::fmt::Display for InfraErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfraErrorKind::PageLoad => write!(f, "page load"),
            InfraErrorKind::Timeout => write!(f, "timeout"),
            InfraErrorKind::Crash => write!(f, "crash"),
            InfraErrorKind::Spawn => write!(f, "spawn"),
            InfraErrorKind::Protocol => write!(f, "protocol"),
            InfraErrorKind::Cancelled => write!(f, "cancelled"),
            InfraErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Outcome of exactly one attempt against one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptResult {
    Success { code: String },
    /// The target flagged this proxy identity.
    Detected,
    TryAgain,
    InfraError { kind: InfraErrorKind },
    TimedOut,
}

impl AttemptResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptResult::Success { .. })
    }
}

impl std::fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptResult::Success { .. } => write!(f, "Success"),
            AttemptResult::Detected => write!(f, "Detected"),
            AttemptResult::TryAgain => write!(f, "Try again"),
            AttemptResult::InfraError { kind } => write!(f, "Infra error ({})", kind),
            AttemptResult::TimedOut => write!(f, "Timed out"),
        }
    }
}

/// Terminal classification handed back to the caller of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SolveOutcome {
    Solved { code: String },
    /// The configured attempt cap was reached.
    Exhausted,
    TimedOut,
    /// The pool had nothing eligible for the whole deadline window.
    NoProxyAvailable,
}

impl SolveOutcome {
    pub fn is_solved(&self) -> bool {
        matches!(self, SolveOutcome::Solved { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            SolveOutcome::Solved { code } => Some(code),
            _ => None,
        }
    }
}

impl std::fmt::Display for SolveOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveOutcome::Solved { .. } => write!(f, "Solved"),
            SolveOutcome::Exhausted => write!(f, "Exhausted"),
            SolveOutcome::TimedOut => write!(f, "Timed out"),
            SolveOutcome::NoProxyAvailable => write!(f, "No proxy available"),
        }
    }
}

/// One incoming solve request. Owns nothing but its parameters and its
/// overall timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveRequest {
    pub page_url: String,
    pub site_key: String,
    pub timeout: Duration,
}

impl SolveRequest {
    pub fn new(
        page_url: impl Into<String>,
        site_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RequestError> {
        let page_url = page_url.into().trim().to_string();
        let site_key = site_key.into().trim().to_string();

        if site_key.is_empty() {
            return Err(RequestError::MissingSiteKey);
        }
        if Url::parse(&page_url).is_err() {
            return Err(RequestError::InvalidPageUrl(page_url));
        }

        Ok(Self { page_url, site_key, timeout })
    }
}

/// Outcome of a request plus what it took to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveReport {
    pub request_id: u64,
    pub outcome: SolveOutcome,
    pub attempts: u32,
    pub elapsed: Duration,
}
