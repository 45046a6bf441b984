//! Periodic recursive discovery of new NZB files
//!
//! The complement to the event watcher: a ticker-driven recursive walk
//! of the watch root. A guard flag keeps long scans from overlapping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::queue::Queue;
use crate::watcher::{absolute_or_original, scan_directory_for_nzb};

/// Periodically scans a directory tree for NZB files
pub struct Scanner {
    dir: PathBuf,
    queue: Arc<Queue>,
    scan_interval: Duration,
    scanning: AtomicBool,
}

impl Scanner {
    /// Scanner rooted at `dir`, walking every `scan_interval`
    pub fn new(dir: &Path, queue: Arc<Queue>, scan_interval: Duration) -> Self {
        Self {
            dir: absolute_or_original(dir),
            queue,
            scan_interval,
            scanning: AtomicBool::new(false),
        }
    }

    /// Run the scan loop until the token is cancelled.
    ///
    /// The first tick fires immediately, giving an initial scan at
    /// startup.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            directory = %self.dir.display(),
            interval = ?self.scan_interval,
            "starting scanner"
        );

        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("scanner stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if self.scanning.swap(true, Ordering::SeqCst) {
                        debug!("previous scan still in progress, skipping");
                        continue;
                    }
                    scan_directory_for_nzb(&self.dir, &self.dir, &self.queue, &token).await;
                    self.scanning.store(false, Ordering::SeqCst);
                }
            }
        }
    }
}
