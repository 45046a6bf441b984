//! NNTP connection pool
//!
//! The repair pipeline only depends on the [`ArticlePool`] contract:
//! fetch a decoded article body by message-id, post an encoded article.
//! [`ConnectionPool`] is the default implementation, multiplexing
//! authenticated sessions across the configured providers.

mod error;
mod pool;
mod protocol;

pub use error::NntpError;
pub use pool::ConnectionPool;
pub use protocol::NntpConnection;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Contract between the repair pipeline and a Usenet connection pool.
///
/// `ArticleNotFound` from `fetch_body` is the all-providers-miss signal
/// the pipeline routes into the broken-segment collector; every other
/// error is transport trouble.
#[async_trait]
pub trait ArticlePool: Send + Sync {
    /// Fetch and yEnc-decode the body of an article
    async fn fetch_body(
        &self,
        token: &CancellationToken,
        message_id: &str,
        groups: &[String],
    ) -> Result<Vec<u8>, NntpError>;

    /// Post a fully encoded article
    async fn post(&self, token: &CancellationToken, article: &[u8]) -> Result<(), NntpError>;

    /// Close idle connections; the pool is unusable afterwards
    async fn close(&self);
}
