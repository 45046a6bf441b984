//! Re-upload of reconstructed segments

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::article::{Article, random_message_id, random_string};
use crate::config::{Config, ObfuscationPolicy};
use crate::error::{Error, Result};
use crate::nntp::ArticlePool;
use crate::nzb::Nzb;
use crate::utils::read_exact_at;
use crate::yenc::YencEncoder;

const OBFUSCATED_NAME_LENGTH: usize = 32;

/// Post every broken segment from the repaired files on disk and remap
/// the in-memory manifest to the fresh message-ids.
///
/// Per file: bounded fan-out over that file's broken segments with
/// cancel-on-first-error; successful posts replace `segments[n-1].id`
/// even when a sibling later fails.
pub(super) async fn replace_broken_segments(
    token: &CancellationToken,
    cfg: &Config,
    pool: &Arc<dyn ArticlePool>,
    nzb: &mut Nzb,
    broken: &BTreeMap<usize, Vec<usize>>,
    dir: &Path,
) -> Result<()> {
    let encoder = YencEncoder::default();

    for (&file_index, segment_indices) in broken {
        if token.is_cancelled() {
            return Ok(());
        }

        let file = &nzb.files[file_index];
        let path = dir.join(&file.filename);
        let handle = Arc::new(File::open(&path)?);
        let file_size = handle.metadata()?.len();
        let file_token = token.child_token();

        let total_files = nzb.total_files;
        let results: Vec<Result<Option<(usize, String)>>> =
            stream::iter(segment_indices.iter().copied())
                .map(|segment_index| {
                    let segment = &file.segments[segment_index];
                    let pool = Arc::clone(pool);
                    let handle = Arc::clone(&handle);
                    let file_token = file_token.clone();
                    let encoder = encoder.clone();

                    let part_size = segment.bytes;
                    let part_num = u64::from(segment.number);
                    let part_begin = (part_num - 1) * part_size;
                    let old_id = segment.id.clone();
                    let file_num = file.number;
                    let poster = file.poster.clone();
                    let groups = file.groups.clone();
                    let date = Utc
                        .timestamp_opt(file.date, 0)
                        .single()
                        .unwrap_or_else(Utc::now);

                    let (subject, filename) = match cfg.upload.obfuscation_policy {
                        ObfuscationPolicy::None => (
                            format!(
                                "[{}/{}] {} - \"\" yEnc ({}/{})",
                                file.number,
                                total_files,
                                file.filename,
                                segment.number,
                                file.segments.len()
                            ),
                            file.filename.clone(),
                        ),
                        ObfuscationPolicy::Full => (
                            random_string(OBFUSCATED_NAME_LENGTH),
                            random_string(OBFUSCATED_NAME_LENGTH),
                        ),
                    };

                    async move {
                        if file_token.is_cancelled() {
                            return Ok(None);
                        }

                        let body =
                            read_exact_at(&handle, part_size as usize, part_begin).await?;

                        let message_id = random_message_id();
                        let article = Article {
                            part_num,
                            part_total: if part_size > 0 {
                                file_size / part_size
                            } else {
                                0
                            },
                            part_size,
                            part_begin,
                            part_end: part_num * part_size,
                            file_num,
                            file_total: total_files,
                            file_size,
                            subject,
                            poster,
                            groups,
                            message_id: message_id.clone(),
                            filename,
                            date: Some(date),
                            custom_headers: Vec::new(),
                            body,
                        };

                        let encoded = article.encode(&encoder);
                        match pool.post(&file_token, &encoded).await {
                            Ok(()) => {
                                info!(old_id = %old_id, new_id = %message_id, "uploaded replacement segment");
                                Ok(Some((segment_index, message_id)))
                            }
                            Err(e) if e.is_cancelled() => Ok(None),
                            Err(e) => {
                                error!(segment = %old_id, error = %e, "segment upload failed, cancelling file");
                                file_token.cancel();
                                Err(Error::Nntp(e))
                            }
                        }
                    }
                })
                .buffer_unordered(cfg.upload_workers.max(1))
                .collect()
                .await;

        // Apply successful remaps before propagating the first error so
        // partial progress is kept in the manifest.
        let mut first_error = None;
        let mut uploaded = 0usize;
        for result in results {
            match result {
                Ok(Some((segment_index, message_id))) => {
                    nzb.files[file_index].segments[segment_index].id = message_id;
                    uploaded += 1;
                }
                Ok(None) => {}
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }

        info!(
            file = %nzb.files[file_index].filename,
            uploaded,
            "finished uploading replacement segments"
        );

        if let Some(e) = first_error {
            return Err(e);
        }
    }

    Ok(())
}
