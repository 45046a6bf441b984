//! Per-file segment download fan-out

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::nntp::ArticlePool;
use crate::nzb::NzbFile;
use crate::utils::write_all_at;

use super::BrokenSegment;

/// Download every segment of one file into `dir` with a bounded fan-out.
///
/// Segment bodies land at `(number - 1) × observed_size`, where the
/// observed size is fixed by the first successfully downloaded segment —
/// completion order is irrelevant. Article-not-found is routed into
/// `broken_tx` when wired (payload files) and is an error otherwise
/// (par2 sidecars). Any other fetch error cancels the sibling tasks and
/// fails the file. After the fan-out, the observed size is propagated to
/// segments that were advertised with the wrong size so the re-upload
/// step computes matching offsets.
pub(super) async fn download_file(
    token: &CancellationToken,
    workers: usize,
    pool: &Arc<dyn ArticlePool>,
    file: &mut NzbFile,
    file_index: usize,
    broken_tx: Option<&mpsc::UnboundedSender<BrokenSegment>>,
    dir: &Path,
) -> Result<()> {
    let path = dir.join(&file.filename);
    if path.exists() {
        info!(file = %file.filename, "file already exists, skipping download");
        return Ok(());
    }

    info!(file = %file.filename, segments = file.segments.len(), "starting download");

    let out = Arc::new(File::create(&path)?);
    let observed_size: Arc<OnceLock<u64>> = Arc::new(OnceLock::new());
    // Cancel-on-first-error scope for this file's tasks only
    let file_token = token.child_token();

    let groups = Arc::new(file.groups.clone());
    let results: Vec<Result<()>> = stream::iter(file.segments.iter().enumerate())
        .map(|(segment_index, segment)| {
            let pool = Arc::clone(pool);
            let out = Arc::clone(&out);
            let observed_size = Arc::clone(&observed_size);
            let groups = Arc::clone(&groups);
            let file_token = file_token.clone();
            let id = segment.id.clone();
            let number = segment.number;

            async move {
                if file_token.is_cancelled() {
                    return Ok(());
                }

                match pool.fetch_body(&file_token, &id, &groups).await {
                    Ok(body) => {
                        let size = *observed_size.get_or_init(|| body.len() as u64);
                        let offset = u64::from(number - 1) * size;
                        write_all_at(&out, body, offset).await?;
                        Ok(())
                    }
                    Err(e) if e.is_not_found() => {
                        match broken_tx {
                            Some(tx) => {
                                debug!(segment = %id, "article not found, collecting for repair");
                                let _ = tx.send(BrokenSegment {
                                    file_index,
                                    segment_index,
                                });
                                Ok(())
                            }
                            None => Err(Error::Nntp(e)),
                        }
                    }
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => {
                        error!(segment = %id, error = %e, "segment download failed, cancelling file");
                        file_token.cancel();
                        Err(Error::Nntp(e))
                    }
                }
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    for result in results {
        result?;
    }

    if let Some(&size) = observed_size.get() {
        for segment in &mut file.segments {
            if segment.bytes != size {
                segment.bytes = size;
            }
        }
    }

    Ok(())
}
