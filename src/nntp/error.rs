//! NNTP error type

use thiserror::Error;

/// Errors surfaced by the connection pool and protocol layer
#[derive(Debug, Error)]
pub enum NntpError {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or configuration failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server rejected the credentials
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Server demands authentication mid-session
    #[error("authentication required")]
    AuthRequired,

    /// No provider carries the article — routed into the broken-segment
    /// collector, never treated as a transport failure
    #[error("article {0} not found at any provider")]
    ArticleNotFound(String),

    /// Server answered with a status code outside the expected set
    #[error("unexpected response {0}: {1}")]
    UnexpectedResponse(u16, String),

    /// Malformed exchange
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Server refused the posted article
    #[error("post rejected: {0}")]
    PostRejected(String),

    /// The pool has no providers configured
    #[error("no providers configured")]
    NoProviders,

    /// Operation interrupted by shutdown
    #[error("operation cancelled")]
    Cancelled,
}

impl NntpError {
    /// True for the article-not-found routing signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ArticleNotFound(_))
    }

    /// True when the operation was interrupted by shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
