//! Error types for nzb-repair
//!
//! One top-level [`Error`] with domain sub-enums for the queue and the
//! par2 driver. NNTP errors carry their own enum because article-not-found
//! is a routing signal for the repair pipeline, not a failure.

use thiserror::Error;

/// Result type alias for nzb-repair operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-repair
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing file, malformed YAML, bad value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid NZB manifest
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(#[from] crate::nntp::NntpError),

    /// Job queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Par2 driver error
    #[error("par2 error: {0}")]
    Par2(#[from] Par2Error),

    /// HTTP error (par2 binary fetcher)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error (release metadata JSON)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem watcher error
    #[error("watch error: {0}")]
    Watch(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Job queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to open or migrate the queue store
    #[error("failed to open queue store: {0}")]
    OpenFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Par2 driver errors
///
/// Exit codes 1..=8 carry the canonical name from the par2cmdline manual
/// plus whatever the binary wrote to stderr.
#[derive(Debug, Error)]
pub enum Par2Error {
    /// The par2 binary could not be launched at all
    #[error("failed to launch par2: {0}")]
    Spawn(#[source] std::io::Error),

    /// The par2 binary exited with a known nonzero code
    #[error("par2 exited with code {code} ({name}): {stderr}")]
    ExitStatus {
        /// Exit code reported by the process
        code: i32,
        /// Canonical name for the exit code
        name: &'static str,
        /// Accumulated stderr output
        stderr: String,
    },

    /// The par2 binary exited with a code outside the documented table
    #[error("par2 exited with unknown code {code}: {stderr}")]
    UnknownExitStatus {
        /// Exit code reported by the process
        code: i32,
        /// Accumulated stderr output
        stderr: String,
    },

    /// The par2 binary was killed by a signal
    #[error("par2 terminated by signal: {stderr}")]
    Terminated {
        /// Accumulated stderr output
        stderr: String,
    },
}
