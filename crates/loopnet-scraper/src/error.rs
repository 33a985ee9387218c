//! Error types for the fetch pipeline.
//!
//! Capability errors (`TransportError`, `RenderError`) stay inside the
//! orchestrator. Callers only ever see a [`FetchFailure`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal failure classes returned by a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The target rejected the request outright (HTTP 403). Never retried.
    Blocked,
    /// A challenge page was served and the browser fallback was disabled,
    /// failed, or still ended on a challenge page.
    ChallengeUnsolved,
    /// Transient transport or server errors used up the retry budget.
    MaxRetriesExceeded,
    /// Failure that cannot be retried: the client is closed or the URL is malformed.
    Transport,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Blocked => "blocked",
            FailureKind::ChallengeUnsolved => "challenge_unsolved",
            FailureKind::MaxRetriesExceeded => "max_retries_exceeded",
            FailureKind::Transport => "transport",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed fetch: the kind plus a human-readable detail string.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn blocked(url: &str) -> Self {
        Self::new(FailureKind::Blocked, format!("blocked (403) for URL: {url}"))
    }

    pub fn closed() -> Self {
        Self::new(FailureKind::Transport, "client closed")
    }
}

/// Result of a top-level fetch: page content or a typed failure.
pub type FetchResult = Result<String, FetchFailure>;

/// A single request that did not produce an HTTP response.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Request(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(0)
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_builder() {
            TransportError::InvalidUrl(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Failure of the real-browser fallback.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("browser fallback disabled")]
    Disabled,

    #[error("browser unavailable: {0}")]
    Unavailable(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("render timed out after {0}ms")]
    Timeout(u64),

    #[error("challenge page persisted after browser render")]
    ChallengePersisted,
}

/// Returned by the rate limiter once it has been closed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("rate limiter closed")]
pub struct LimiterClosed;
