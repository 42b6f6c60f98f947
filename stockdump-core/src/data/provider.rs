//! Quote provider trait and fetch error classification.
//!
//! The QuoteProvider trait abstracts over the remote endpoint so the fetcher
//! can be driven by a scripted double in tests.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::manifest::ManifestEntry;

/// Raw response body for one manifest entry.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// Per-request failure.
///
/// Transient variants are retried with backoff; rejections are recorded
/// immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider returned HTTP {status}")]
    ServerError { status: u16 },

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("provider returned an empty body")]
    EmptyBody,

    #[error("authentication rejected (HTTP {status}); refresh crumb and cookie")]
    AuthRejected { status: u16 },

    #[error("symbol not found")]
    SymbolNotFound,

    #[error("request rejected with HTTP {status}")]
    BadRequest { status: u16 },

    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("run cancelled before the request completed")]
    Cancelled,
}

/// Coarse classification used in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FetchTransient,
    FetchRejected,
    WriteFailed,
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout
                | FetchError::RateLimited { .. }
                | FetchError::ServerError { .. }
                | FetchError::Network(_)
                | FetchError::EmptyBody
        )
    }

    pub fn kind(&self) -> FailureKind {
        if matches!(self, FetchError::Cancelled) {
            FailureKind::Cancelled
        } else if self.is_retryable() {
            FailureKind::FetchTransient
        } else {
            FailureKind::FetchRejected
        }
    }

    /// Server-requested pause before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            FetchError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Source of raw quote payloads.
pub trait QuoteProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Perform exactly one request for `entry`. Retries are the caller's job.
    fn fetch(&self, entry: &ManifestEntry) -> Result<RawPayload, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(FetchError::ServerError { status: 503 }.is_retryable());
        assert!(FetchError::Network("reset".into()).is_retryable());
    }

    #[test]
    fn rejections_are_not_retryable() {
        assert!(!FetchError::AuthRejected { status: 401 }.is_retryable());
        assert!(!FetchError::SymbolNotFound.is_retryable());
        assert!(!FetchError::BadRequest { status: 400 }.is_retryable());
        assert_eq!(FetchError::SymbolNotFound.kind(), FailureKind::FetchRejected);
    }

    #[test]
    fn cancellation_is_its_own_kind() {
        assert!(!FetchError::Cancelled.is_retryable());
        assert_eq!(FetchError::Cancelled.kind(), FailureKind::Cancelled);
    }
}
