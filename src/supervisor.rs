//! Watch-mode supervisor
//!
//! Owns the queue, both connection pools, and the par2 runner. Runs the
//! event watcher, the periodic scanner, and a ticker-driven worker that
//! drains the queue through the repair pipeline. Shutdown arrives via
//! the shared cancellation token; the caller closes the pools and the
//! queue after `run` returns.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::nntp::ArticlePool;
use crate::par2::Par2Runner;
use crate::queue::{Job, JobStatus, Queue};
use crate::repair::repair_nzb;
use crate::scanner::Scanner;
use crate::watcher::Watcher;

const WORKER_INTERVAL: Duration = Duration::from_secs(5);

/// Runs discovery and repair workers against a watch directory
pub struct Supervisor {
    cfg: Config,
    queue: Arc<Queue>,
    download_pool: Arc<dyn ArticlePool>,
    upload_pool: Arc<dyn ArticlePool>,
    par2: Arc<dyn Par2Runner>,
    watch_dir: PathBuf,
    output_base: PathBuf,
    tmp_base: PathBuf,
}

impl Supervisor {
    /// Assemble a supervisor; paths should already be absolute
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        queue: Arc<Queue>,
        download_pool: Arc<dyn ArticlePool>,
        upload_pool: Arc<dyn ArticlePool>,
        par2: Arc<dyn Par2Runner>,
        watch_dir: PathBuf,
        output_base: PathBuf,
        tmp_base: PathBuf,
    ) -> Self {
        Self {
            cfg,
            queue,
            download_pool,
            upload_pool,
            par2,
            watch_dir,
            output_base,
            tmp_base,
        }
    }

    /// Run watcher, scanner, and worker until the token is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let watcher = Watcher::new(&self.watch_dir, Arc::clone(&self.queue));
        let scanner = Scanner::new(
            &self.watch_dir,
            Arc::clone(&self.queue),
            self.cfg.scan_interval,
        );

        let (watch_result, scan_result, worker_result) = tokio::join!(
            watcher.run(token.clone()),
            scanner.run(token.clone()),
            self.worker_loop(token.clone()),
        );
        watch_result?;
        scan_result?;
        worker_result
    }

    async fn worker_loop(&self, token: CancellationToken) -> Result<()> {
        info!("starting repair worker");
        let mut ticker = tokio::time::interval(WORKER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("repair worker stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let job = match self.queue.get_next_job().await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "failed to get next job from queue");
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(WORKER_INTERVAL) => continue,
                    }
                }
            };

            info!(
                job_id = job.id,
                filepath = %job.filepath,
                relative_path = %job.relative_path,
                "processing job"
            );
            self.process_job(&token, job).await;
        }
    }

    async fn process_job(&self, token: &CancellationToken, job: Job) {
        let output_path = match self.job_output_path(&job) {
            Ok(path) => path,
            Err(message) => {
                error!(job_id = job.id, message, "rejecting job");
                if let Err(e) = self
                    .queue
                    .update_job_status(job.id, JobStatus::Failed, Some(&message))
                    .await
                {
                    error!(job_id = job.id, error = %e, "failed to mark job failed");
                }
                self.sweep_failed().await;
                return;
            }
        };

        let job_name = Path::new(&job.filepath)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("job-{}", job.id));
        let work_dir = self.tmp_base.join(job_name);

        let start = std::time::Instant::now();
        let result = repair_nzb(
            token,
            &self.cfg,
            Arc::clone(&self.download_pool),
            Arc::clone(&self.upload_pool),
            self.par2.as_ref(),
            Path::new(&job.filepath),
            Some(&output_path),
            &work_dir,
        )
        .await;

        match result {
            Ok(()) => {
                info!(
                    job_id = job.id,
                    output = %output_path.display(),
                    elapsed = ?start.elapsed(),
                    "job completed"
                );
                if let Err(e) = self
                    .queue
                    .update_job_status(job.id, JobStatus::Completed, None)
                    .await
                {
                    error!(job_id = job.id, error = %e, "failed to mark job completed");
                }
            }
            Err(repair_err) => {
                error!(
                    job_id = job.id,
                    error = %repair_err,
                    elapsed = ?start.elapsed(),
                    "job failed"
                );
                if let Err(e) = self
                    .queue
                    .update_job_status(job.id, JobStatus::Failed, Some(&repair_err.to_string()))
                    .await
                {
                    error!(job_id = job.id, error = %e, "failed to mark job failed");
                }
                self.sweep_failed().await;
            }
        }
    }

    /// Move exhausted failed files into the broken folder
    async fn sweep_failed(&self) {
        match self
            .queue
            .move_failed_files(self.cfg.max_retries, &self.cfg.broken_folder)
            .await
        {
            Ok(0) => {}
            Ok(moved) => info!(moved, "moved exhausted files to broken folder"),
            Err(e) => error!(error = %e, "failed to sweep broken files"),
        }
    }

    /// Derive the output path for a job from its relative path.
    ///
    /// Rejects anything that would escape the output base: absolute
    /// paths, empty or `.` paths, and paths reaching upward with `..`.
    fn job_output_path(&self, job: &Job) -> std::result::Result<PathBuf, String> {
        let cleaned = clean_path(Path::new(&job.relative_path));

        let invalid = job.relative_path.is_empty()
            || cleaned.as_os_str().is_empty()
            || cleaned == Path::new(".")
            || cleaned.is_absolute()
            || cleaned
                .components()
                .next()
                .is_some_and(|c| c == Component::ParentDir);
        if invalid {
            return Err(format!(
                "invalid relative path calculated: {:?}",
                job.relative_path
            ));
        }

        let output_path = self.output_base.join(cleaned);
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                format!("failed to create output subdirectory {}: {e}", parent.display())
            })?;
        }
        Ok(output_path)
    }
}

/// Lexically normalize a path: drop `.` components and resolve `..`
/// against preceding normal components
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let ends_with_normal = matches!(
                    cleaned.components().next_back(),
                    Some(Component::Normal(_))
                );
                if ends_with_normal {
                    cleaned.pop();
                } else {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Par2Error;
    use crate::nntp::NntpError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NotFoundPool;

    #[async_trait]
    impl ArticlePool for NotFoundPool {
        async fn fetch_body(
            &self,
            _token: &CancellationToken,
            message_id: &str,
            _groups: &[String],
        ) -> std::result::Result<Vec<u8>, NntpError> {
            Err(NntpError::ArticleNotFound(message_id.to_string()))
        }

        async fn post(
            &self,
            _token: &CancellationToken,
            _article: &[u8],
        ) -> std::result::Result<(), NntpError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    struct FailingPar2;

    #[async_trait]
    impl Par2Runner for FailingPar2 {
        async fn repair(
            &self,
            _token: &CancellationToken,
            _dir: &Path,
        ) -> std::result::Result<(), Par2Error> {
            Err(Par2Error::ExitStatus {
                code: 2,
                name: "Repair not possible",
                stderr: "simulated".to_string(),
            })
        }
    }

    async fn test_supervisor(dir: &TempDir) -> (Supervisor, Arc<Queue>) {
        let queue = Arc::new(Queue::open(&dir.path().join("queue.db")).await.unwrap());
        let cfg = Config {
            download_workers: 1,
            upload_workers: 1,
            broken_folder: dir.path().join("broken"),
            ..Default::default()
        }
        .merge_with_defaults();

        let supervisor = Supervisor::new(
            cfg,
            Arc::clone(&queue),
            Arc::new(NotFoundPool),
            Arc::new(NotFoundPool),
            Arc::new(FailingPar2),
            dir.path().join("watch"),
            dir.path().join("out"),
            dir.path().join("tmp"),
        );
        (supervisor, queue)
    }

    fn job_with_relative(relative_path: &str) -> Job {
        Job {
            id: 1,
            filepath: "/watch/a.nzb".to_string(),
            relative_path: relative_path.to_string(),
            status: "processing".to_string(),
            error_msg: None,
            retry_count: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn traversal_shaped_relative_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (supervisor, _queue) = test_supervisor(&dir).await;

        for bad in ["", ".", "..", "../escape.nzb", "a/../../escape.nzb", "/abs/path.nzb"] {
            let result = supervisor.job_output_path(&job_with_relative(bad));
            assert!(result.is_err(), "path {bad:?} must be rejected");
            assert!(result.unwrap_err().contains("invalid relative path"));
        }
    }

    #[tokio::test]
    async fn safe_relative_paths_land_under_the_output_base() {
        let dir = TempDir::new().unwrap();
        let (supervisor, _queue) = test_supervisor(&dir).await;

        let path = supervisor
            .job_output_path(&job_with_relative("sub/./a.nzb"))
            .unwrap();
        assert_eq!(path, dir.path().join("out").join("sub").join("a.nzb"));
        assert!(path.parent().unwrap().exists(), "parent dirs are created");

        // Internal .. that stays inside the base is fine
        let path = supervisor
            .job_output_path(&job_with_relative("sub/../b.nzb"))
            .unwrap();
        assert_eq!(path, dir.path().join("out").join("b.nzb"));
    }

    #[tokio::test]
    async fn invalid_path_marks_the_job_failed_with_a_diagnostic() {
        let dir = TempDir::new().unwrap();
        let (supervisor, queue) = test_supervisor(&dir).await;

        queue.add_job("/watch/a.nzb", "../escape.nzb").await.unwrap();
        let job = queue.get_next_job().await.unwrap().unwrap();

        supervisor
            .process_job(&CancellationToken::new(), job)
            .await;

        let row = queue.get_job_by_path("/watch/a.nzb").await.unwrap().unwrap();
        assert!(row.has_status(JobStatus::Failed));
        assert_eq!(row.retry_count, 1);
        assert!(row.error_msg.unwrap().contains("invalid relative path"));
    }

    #[tokio::test]
    async fn failed_repair_marks_job_failed_and_increments_retry() {
        let dir = TempDir::new().unwrap();
        let (supervisor, queue) = test_supervisor(&dir).await;

        // A manifest whose payload segment is missing and whose par2
        // run fails: the re-upload read hits a short file, so the
        // pipeline errors and the supervisor marks the job failed.
        let watch = dir.path().join("watch");
        std::fs::create_dir_all(&watch).unwrap();
        let nzb = watch.join("dead.nzb");
        std::fs::write(
            &nzb,
            r#"<?xml version="1.0"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
 <file poster="p" date="1" subject="[1/2] - &quot;data.mkv&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments><segment bytes="10" number="1">data@test</segment></segments>
 </file>
 <file poster="p" date="1" subject="[2/2] - &quot;data.mkv.par2&quot; yEnc (1/1)">
  <groups><group>alt.binaries.test</group></groups>
  <segments><segment bytes="10" number="1">par@test</segment></segments>
 </file>
</nzb>"#,
        )
        .unwrap();

        queue
            .add_job(nzb.to_str().unwrap(), "dead.nzb")
            .await
            .unwrap();
        let job = queue.get_next_job().await.unwrap().unwrap();

        supervisor
            .process_job(&CancellationToken::new(), job)
            .await;

        let row = queue
            .get_job_by_path(nzb.to_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(row.has_status(JobStatus::Failed), "status: {}", row.status);
        assert_eq!(row.retry_count, 1);
        assert!(row.error_msg.is_some());
    }

    #[test]
    fn clean_path_normalizes_lexically() {
        assert_eq!(clean_path(Path::new("a/./b")), PathBuf::from("a/b"));
        assert_eq!(clean_path(Path::new("a/../b")), PathBuf::from("b"));
        assert_eq!(clean_path(Path::new("../a")), PathBuf::from("../a"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean_path(Path::new(".")), PathBuf::new());
    }
}
