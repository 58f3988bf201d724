//! Error types shared by every layer of the bootstrap client
//!
//! Expected operational failures (a model that will not warm up, a backend that cannot be probed)
//! are reported as booleans by the higher layers. The errors here are the ones that carry
//! information a caller may act on: bad configuration, transport failures and their
//! retry classification, and a pool that cannot produce a client.
use std::time::Duration;
use thiserror::Error;

/// Message fragments that mark a failure as transient.
///
/// Matched case-insensitively against the full error chain of anything the retry executor sees.
pub const RETRYABLE_MARKERS: &[&str] = &["timeout", "timed out", "refused", "reset", "unavailable"];

/// Returns true if `message` contains one of the [`RETRYABLE_MARKERS`].
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// A profile could not be built from the supplied settings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("provider is disabled for {0}")]
    Disabled(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A single request to the backend failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Transient failure: timeout, refused or reset connection, temporarily unavailable backend.
    #[error("retryable transport error: {0}")]
    Retryable(String),

    /// Anything else. Surfaced immediately, never retried.
    #[error("transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Classifies a free-form failure message against the retryable vocabulary.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_retryable_message(&message) {
            TransportError::Retryable(message)
        } else {
            TransportError::Fatal(message)
        }
    }

    pub(crate) fn timed_out(deadline: Duration) -> Self {
        TransportError::Retryable(format!("request timeout after {}ms", deadline.as_millis()))
    }

    pub(crate) fn closed() -> Self {
        TransportError::Fatal("client closed".to_string())
    }

    /// Maps a non-success HTTP status onto the retry vocabulary.
    pub(crate) fn from_status(status: hyper::StatusCode, body: &[u8]) -> Self {
        let detail = String::from_utf8_lossy(body);
        let detail = detail.trim();
        let message = if detail.is_empty() {
            format!("backend returned status {status}")
        } else {
            format!("backend returned status {status}: {detail}")
        };

        match status.as_u16() {
            408 | 429 | 500 | 502 | 503 | 504 => {
                TransportError::Retryable(format!("temporarily unavailable: {message}"))
            }
            _ => TransportError::Fatal(message),
        }
    }

    /// Classifies an error from the hyper client by kind first, then by its full source chain.
    pub(crate) fn from_client_error(error: hyper_util::client::legacy::Error) -> Self {
        let chain = error_chain(&error);
        if error.is_connect() {
            TransportError::Retryable(format!("connection refused: {chain}"))
        } else {
            TransportError::from_message(chain)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }
}

/// The pool could not hand out a client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("failed to create http client: {0}")]
    Create(String),

    /// The pool was released after the caller started; the caller's work is stale.
    #[error("connection pool was released")]
    Released,
}

/// Renders an error and all of its sources as one line.
pub(crate) fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
