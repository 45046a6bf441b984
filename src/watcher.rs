//! Filesystem-event discovery of new NZB files
//!
//! A recursive watch on the configured directory feeds the job queue.
//! Create events for regular `.nzb` files enqueue directly; Create
//! events for directories trigger an asynchronous recursive scan, which
//! covers moves and bulk drops that surface as a single directory event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::queue::Queue;

/// Watches a directory tree for new NZB files
pub struct Watcher {
    dir: PathBuf,
    queue: Arc<Queue>,
}

impl Watcher {
    /// Watcher rooted at `dir`; relative paths in the queue are computed
    /// against the absolute form of this root
    pub fn new(dir: &Path, queue: Arc<Queue>) -> Self {
        let dir = absolute_or_original(dir);
        Self { dir, queue }
    }

    /// Run the watch loop until the token is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                if tx.send(res).is_err() {
                    // receiver gone; the loop is shutting down
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        watcher
            .watch(&self.dir, RecursiveMode::Recursive)
            .map_err(|e| Error::Watch(format!("failed to watch {}: {e}", self.dir.display())))?;

        info!(directory = %self.dir.display(), "watching for NZB files");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("watcher stopping");
                    return Ok(());
                }
                event = rx.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event, &token).await,
                    Some(Err(e)) => error!(error = %e, "filesystem watcher error"),
                    None => {
                        info!("watch channel closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: Event, token: &CancellationToken) {
        if !matches!(event.kind, EventKind::Create(_)) {
            return;
        }

        for path in event.paths {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "created path vanished before stat");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to stat created path");
                    continue;
                }
            };

            if metadata.is_dir() {
                info!(directory = %path.display(), "directory created, scheduling scan");
                let root = self.dir.clone();
                let queue = Arc::clone(&self.queue);
                let token = token.clone();
                tokio::spawn(async move {
                    scan_directory_for_nzb(&root, &path, &queue, &token).await;
                });
            } else if metadata.is_file() && is_nzb(&path) {
                debug!(path = %path.display(), "NZB file created");
                enqueue_nzb(&self.dir, &path, &self.queue).await;
            }
        }
    }
}

/// Case-insensitive `.nzb` extension check
pub(crate) fn is_nzb(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("nzb"))
        .unwrap_or(false)
}

pub(crate) fn absolute_or_original(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to absolutize path, using as-is");
        path.to_path_buf()
    })
}

/// Relative path against the watch root, falling back to the base
/// filename when the file sits outside it
pub(crate) fn relative_to_root(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Add one discovered NZB to the queue; duplicate suppression is the
/// queue's responsibility
pub(crate) async fn enqueue_nzb(root: &Path, path: &Path, queue: &Queue) {
    let abs = absolute_or_original(path);
    let rel = relative_to_root(root, &abs);

    match queue.add_job(&abs.to_string_lossy(), &rel).await {
        Ok(()) => info!(path = %abs.display(), relative = %rel, "added job to queue"),
        Err(e) => error!(path = %abs.display(), error = %e, "failed to add job to queue"),
    }
}

/// Recursively scan a directory and enqueue every `.nzb` inside it.
///
/// Unreadable subtrees are skipped; other entries continue.
pub(crate) async fn scan_directory_for_nzb(
    root: &Path,
    dir: &Path,
    queue: &Queue,
    token: &CancellationToken,
) {
    info!(directory = %dir.display(), "scanning directory for NZB files");
    let start = std::time::Instant::now();

    let dir_owned = dir.to_path_buf();
    let found = tokio::task::spawn_blocking(move || {
        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(&dir_owned) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "error accessing path during scan");
                    continue;
                }
            };
            if entry.file_type().is_file() && is_nzb(entry.path()) {
                found.push(entry.into_path());
            }
        }
        found
    })
    .await
    .unwrap_or_default();

    for path in found {
        if token.is_cancelled() {
            info!(directory = %dir.display(), "directory scan cancelled");
            return;
        }
        enqueue_nzb(root, &path, queue).await;
    }

    info!(
        directory = %dir.display(),
        elapsed = ?start.elapsed(),
        "finished scanning directory"
    );
}
