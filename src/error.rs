//! Error types for the relay library.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while polling the mailbox or talking to the tracker.
///
/// Per-bug tracker errors (`NotFound`, `NotPermitted`) are not errors here;
/// they arrive as [`crate::tracker::BugRecord::Error`] and are rendered.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The mailbox lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for the lock on {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The bugmail parser failed in an unexpected way.
    #[error("bugmail parser failed: {0}")]
    ParseFatal(String),

    /// The tracker answered with an empty body.
    #[error("got empty content from {0}")]
    FetchEmpty(String),

    /// Transport-level HTTP failure, including timeouts.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The tracker returned XML we could not parse.
    #[error("malformed bug XML: {0}")]
    Xml(#[from] roxmltree::Error),

    /// Invalid configuration file.
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
