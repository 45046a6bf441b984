//! Application entry points
//!
//! Glue between the CLI and the library: config loading, pool and par2
//! setup, temporary-directory preparation, and the two run modes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::nntp::{ArticlePool, ConnectionPool};
use crate::par2::{Par2Cmd, ensure_par2_executable};
use crate::queue::Queue;
use crate::repair::repair_nzb;
use crate::supervisor::Supervisor;

const DEFAULT_WATCH_OUTPUT_DIR: &str = "./repaired";

/// One-shot repair of a single NZB file
pub async fn run_single_repair(
    token: CancellationToken,
    cfg: Config,
    nzb_file: &Path,
    output: Option<&Path>,
    tmp_dir: Option<&Path>,
) -> Result<()> {
    let tmp_base = prepare_tmp_dir(tmp_dir).await?;

    let par2_exe = ensure_par2_executable(&cfg).await?;
    let par2 = Par2Cmd::new(par2_exe);

    let (download_pool, upload_pool) = create_pools(&cfg);

    let output_file = single_output_file_path(nzb_file, output)?;
    info!(
        input = %nzb_file.display(),
        output = %output_file.display(),
        temp = %tmp_base.display(),
        "starting repair"
    );

    let base = nzb_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repair".to_string());
    let work_dir = tmp_base.join(base);

    let result = repair_nzb(
        &token,
        &cfg,
        Arc::clone(&download_pool),
        Arc::clone(&upload_pool),
        &par2,
        nzb_file,
        Some(&output_file),
        &work_dir,
    )
    .await;

    debug!("closing connection pools");
    download_pool.close().await;
    upload_pool.close().await;

    match result {
        Ok(()) => {
            info!(input = %nzb_file.display(), output = %output_file.display(), "repair successful");
            Ok(())
        }
        Err(e) => {
            error!(input = %nzb_file.display(), error = %e, "repair failed");
            Err(e)
        }
    }
}

/// Watch mode: discovery plus a durable queue of repair jobs
pub async fn run_watch(
    token: CancellationToken,
    cfg: Config,
    watch_dir: &Path,
    db_path: &Path,
    output_base: Option<&Path>,
    tmp_dir: Option<&Path>,
) -> Result<()> {
    info!(path = %db_path.display(), "initializing queue store");
    let queue = Arc::new(Queue::open(db_path).await?);

    let cleaned = queue.cleanup_processing_jobs().await?;
    info!(count = cleaned, "cleaned up interrupted jobs");

    let tmp_base = prepare_tmp_dir(tmp_dir).await?;

    let output_base = match output_base {
        Some(path) => path.to_path_buf(),
        None => {
            info!(path = DEFAULT_WATCH_OUTPUT_DIR, "no output directory specified, using default");
            PathBuf::from(DEFAULT_WATCH_OUTPUT_DIR)
        }
    };
    tokio::fs::create_dir_all(&output_base).await?;
    let output_base = std::path::absolute(&output_base)?;
    info!(path = %output_base.display(), "using output directory");

    let par2_exe = ensure_par2_executable(&cfg).await?;
    let par2 = Arc::new(Par2Cmd::new(par2_exe));

    let (download_pool, upload_pool) = create_pools(&cfg);

    let supervisor = Supervisor::new(
        cfg,
        Arc::clone(&queue),
        Arc::clone(&download_pool),
        Arc::clone(&upload_pool),
        par2,
        watch_dir.to_path_buf(),
        output_base,
        tmp_base,
    );

    info!("watcher and worker started, waiting for jobs or termination signal");
    let result = supervisor.run(token).await;

    debug!("closing connection pools");
    download_pool.close().await;
    upload_pool.close().await;

    info!("closing queue store");
    queue.close().await;

    match result {
        Ok(()) => {
            info!("shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "exited with error");
            Err(e)
        }
    }
}

/// Wait for SIGTERM/SIGINT (Ctrl+C elsewhere); used to cancel the shared
/// token for cooperative shutdown
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }
        _ => {
            warn!("could not register signal handlers, using ctrl_c fallback");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Wait for Ctrl+C
#[cfg(not(unix))]
pub async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C");
    }
}

fn create_pools(cfg: &Config) -> (Arc<dyn ArticlePool>, Arc<dyn ArticlePool>) {
    let download_pool: Arc<dyn ArticlePool> =
        Arc::new(ConnectionPool::new(&cfg.download_providers));
    let upload_pool: Arc<dyn ArticlePool> = Arc::new(ConnectionPool::new(&cfg.upload_providers));
    (download_pool, upload_pool)
}

/// Ensure a clean absolute temporary directory, defaulting to a
/// namespaced folder under the system tmp
async fn prepare_tmp_dir(tmp_dir: Option<&Path>) -> Result<PathBuf> {
    let base = match tmp_dir {
        Some(path) => path.to_path_buf(),
        None => std::env::temp_dir().join("nzb-repair"),
    };
    let base = std::path::absolute(&base)?;

    debug!(path = %base.display(), "preparing temporary directory");
    if let Err(e) = tokio::fs::remove_dir_all(&base).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %base.display(), error = %e, "failed to clear temporary directory");
        }
    }
    tokio::fs::create_dir_all(&base).await?;
    Ok(base)
}

/// Resolve the output path for a one-shot repair.
///
/// No output given: `<input stem>_repaired.<ext>` next to the input.
/// An existing directory: the input's basename inside it. Anything else
/// is treated as the output file, provided its parent directory exists.
fn single_output_file_path(input: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let Some(output) = output else {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repaired".to_string());
        let name = match input.extension() {
            Some(ext) => format!("{stem}_repaired.{}", ext.to_string_lossy()),
            None => format!("{stem}_repaired"),
        };
        return Ok(input.with_file_name(name));
    };

    match std::fs::metadata(output) {
        Ok(metadata) if metadata.is_dir() => {
            let base = input
                .file_name()
                .ok_or_else(|| Error::Config(format!("input {} has no filename", input.display())))?;
            Ok(output.join(base))
        }
        Ok(_) => Ok(output.to_path_buf()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let parent = output.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(parent) = parent {
                if !parent.exists() {
                    return Err(Error::Config(format!(
                        "output directory {} does not exist",
                        parent.display()
                    )));
                }
            }
            Ok(output.to_path_buf())
        }
        Err(e) => Err(e.into()),
    }
}
