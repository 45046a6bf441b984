//! Provider-multiplexing connection pool
//!
//! Each provider gets a semaphore sized to its connection limit and a
//! stack of idle connections pruned by age. Fetch walks providers in
//! order, treating 430 as try-the-next-one; only when every provider
//! misses does the caller see `ArticleNotFound`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::yenc;

use super::ArticlePool;
use super::error::NntpError;
use super::protocol::NntpConnection;

struct ProviderState {
    config: ProviderConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<(NntpConnection, Instant)>>,
}

/// Thread-safe pool over a list of providers
pub struct ConnectionPool {
    providers: Vec<Arc<ProviderState>>,
}

impl ConnectionPool {
    /// Build a pool; provider defaults must already be merged
    pub fn new(providers: &[ProviderConfig]) -> Self {
        let providers = providers
            .iter()
            .map(|config| {
                Arc::new(ProviderState {
                    semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
                    idle: Mutex::new(Vec::new()),
                    config: config.clone(),
                })
            })
            .collect();
        Self { providers }
    }

    async fn acquire(&self, state: &ProviderState) -> Result<NntpConnection, NntpError> {
        let max_idle = Duration::from_secs(state.config.max_idle_seconds);
        {
            let mut idle = state.idle.lock().await;
            while let Some((conn, since)) = idle.pop() {
                if since.elapsed() < max_idle {
                    return Ok(conn);
                }
                drop(conn);
            }
        }
        NntpConnection::connect(&state.config).await
    }

    async fn release(&self, state: &ProviderState, conn: NntpConnection) {
        let mut idle = state.idle.lock().await;
        idle.push((conn, Instant::now()));
    }

    async fn fetch_from_provider(
        &self,
        state: &ProviderState,
        message_id: &str,
        groups: &[String],
    ) -> Result<Vec<u8>, NntpError> {
        let mut conn = self.acquire(state).await?;

        // Some servers insist on a group context before BODY by message-id
        for group in groups {
            match conn.join_group(group).await {
                Ok(()) => break,
                Err(NntpError::UnexpectedResponse(411, _)) => continue,
                Err(err) => return Err(err),
            }
        }

        match conn.fetch_body(message_id).await {
            Ok(raw) => {
                self.release(state, conn).await;
                yenc::decode(&raw).map_err(|e| NntpError::ProtocolError(e.to_string()))
            }
            Err(NntpError::ArticleNotFound(id)) => {
                self.release(state, conn).await;
                Err(NntpError::ArticleNotFound(id))
            }
            Err(err) => Err(err),
        }
    }

    async fn post_to_provider(
        &self,
        state: &ProviderState,
        article: &[u8],
    ) -> Result<(), NntpError> {
        let mut conn = self.acquire(state).await?;
        match conn.post(article).await {
            Ok(()) => {
                self.release(state, conn).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ArticlePool for ConnectionPool {
    async fn fetch_body(
        &self,
        token: &CancellationToken,
        message_id: &str,
        groups: &[String],
    ) -> Result<Vec<u8>, NntpError> {
        if self.providers.is_empty() {
            return Err(NntpError::NoProviders);
        }

        let mut last_error = NntpError::ArticleNotFound(message_id.to_string());
        for state in &self.providers {
            if token.is_cancelled() {
                return Err(NntpError::Cancelled);
            }

            let permit = tokio::select! {
                _ = token.cancelled() => return Err(NntpError::Cancelled),
                permit = state.semaphore.acquire() => permit
                    .map_err(|_| NntpError::ProtocolError("pool closed".to_string()))?,
            };

            let result = tokio::select! {
                _ = token.cancelled() => Err(NntpError::Cancelled),
                r = self.fetch_from_provider(state, message_id, groups) => r,
            };
            drop(permit);

            match result {
                Ok(body) => return Ok(body),
                Err(NntpError::ArticleNotFound(id)) => {
                    debug!(provider = %state.config.host, message_id = %id, "article not found, trying next provider");
                    last_error = NntpError::ArticleNotFound(id);
                }
                Err(NntpError::Cancelled) => return Err(NntpError::Cancelled),
                Err(err) => return Err(err),
            }
        }

        Err(last_error)
    }

    async fn post(&self, token: &CancellationToken, article: &[u8]) -> Result<(), NntpError> {
        if self.providers.is_empty() {
            return Err(NntpError::NoProviders);
        }

        let mut last_error = NntpError::NoProviders;
        for state in &self.providers {
            if token.is_cancelled() {
                return Err(NntpError::Cancelled);
            }

            let permit = tokio::select! {
                _ = token.cancelled() => return Err(NntpError::Cancelled),
                permit = state.semaphore.acquire() => permit
                    .map_err(|_| NntpError::ProtocolError("pool closed".to_string()))?,
            };

            let result = tokio::select! {
                _ = token.cancelled() => Err(NntpError::Cancelled),
                r = self.post_to_provider(state, article) => r,
            };
            drop(permit);

            match result {
                Ok(()) => return Ok(()),
                Err(NntpError::Cancelled) => return Err(NntpError::Cancelled),
                Err(err) => {
                    warn!(provider = %state.config.host, error = %err, "post failed, trying next provider");
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    async fn close(&self) {
        for state in &self.providers {
            let mut idle = state.idle.lock().await;
            for (mut conn, _) in idle.drain(..) {
                if let Err(e) = conn.quit().await {
                    debug!(provider = %state.config.host, error = %e, "error closing connection");
                }
            }
        }
    }
}
