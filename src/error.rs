//! Error taxonomy for the orchestrator.
//!
//! Attempt-level errors (`AttemptError`) are absorbed by the execution
//! engine and converted into retry/fallback decisions; they never escape it.
//! Only terminal conditions (`PageError`) reach the caller, as the failed
//! page's final status.

use std::time::Duration;

use thiserror::Error;

/// Errors from a single OCR attempt against one backend.
///
/// These feed the backend health counters and the retry policy. They are
/// never surfaced to callers directly.
#[derive(Debug, Clone, Error)]
pub enum AttemptError {
    /// The attempt exceeded its configured per-attempt timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The backend ran but failed. The detail string is kept for diagnostics.
    #[error("backend execution failed: {0}")]
    Execution(String),
}

/// Terminal, unrecoverable outcome for one page.
#[derive(Debug, Clone, Error)]
pub enum PageError {
    /// Malformed page image. Not retried; surfaced immediately.
    #[error("invalid page image: {0}")]
    InvalidImage(String),

    /// Explicit-mode request against a disabled or unregistered backend.
    /// Not retried; no silent substitution.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Every candidate in the routing plan failed. Carries the last
    /// attempt-level error for diagnostics.
    #[error("all candidates exhausted, last error: {last}")]
    AllCandidatesExhausted { last: String },

    /// The document's processing was cancelled before this page resolved.
    #[error("processing cancelled")]
    Cancelled,
}

/// Errors from loading orchestrator configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
