//! Error types for ContentSift.
//!
//! Library crates use [`SiftError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! [`ProviderError`] is the narrow failure taxonomy of a text-generation
//! backend. Callers map it to their own fallback behavior and never surface
//! the raw transport error to the user.

use std::path::PathBuf;

/// Top-level error type for all ContentSift operations.
#[derive(Debug, thiserror::Error)]
pub enum SiftError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Text-generation backend failure.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// An operation exceeded its time budget.
    #[error("timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// A per-item failure that drops the item from the result.
    #[error("item {content_id} failed: {reason}")]
    ItemFatal { content_id: String, reason: String },

    /// Duplicate detection failed internally.
    #[error("duplicate detection error: {0}")]
    Detection(String),

    /// Response or input parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (out-of-range value, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SiftError>;

impl SiftError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure modes of a text-generation backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Credentials missing or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Rate limit or quota exhausted.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Connection, DNS or transport timeout.
    #[error("network failure: {0}")]
    Network(String),

    /// Anything else, including malformed responses.
    #[error("provider failure: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Quota(_) | Self::Network(_))
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SiftError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = SiftError::validation("concurrency 0 not supported");
        assert!(err.to_string().contains("concurrency 0"));

        let err = SiftError::timeout("process item", 30);
        assert_eq!(err.to_string(), "timed out after 30s: process item");
    }

    #[test]
    fn provider_error_converts() {
        let err: SiftError = ProviderError::Quota("429".into()).into();
        assert!(matches!(err, SiftError::Provider(ProviderError::Quota(_))));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn transient_provider_errors() {
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::Quota("slow down".into()).is_transient());
        assert!(!ProviderError::Auth("bad key".into()).is_transient());
        assert!(!ProviderError::Unknown("?".into()).is_transient());
    }

    #[test]
    fn panic_payloads_render() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 1");
        let caught = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "unknown panic");
    }
}
