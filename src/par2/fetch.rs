//! One-shot download of a prebuilt par2 executable
//!
//! Queries the latest par2cmdline-turbo release, picks the asset matching
//! the host OS and architecture, and writes it to `./par2cmd` with the
//! executable bit set.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

const RELEASE_URL: &str =
    "https://api.github.com/repos/animetosho/par2cmdline-turbo/releases/latest";
const PAR2_CMD_NAME: &str = "par2cmd";
const DEFAULT_PAR2_EXE: &str = "./par2cmd";

/// Latest-release metadata returned by the release endpoint
#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Resolve the release-asset suffix for an `(os, arch)` pair.
///
/// `os`/`arch` use the `std::env::consts` vocabulary.
fn asset_suffix(os: &str, arch: &str) -> Result<&'static str> {
    let suffix = match (os, arch) {
        ("linux", "x86_64") => "linux-amd64.xz",
        ("linux", "aarch64") => "linux-arm64.xz",
        ("linux", "arm") => "linux-armhf.xz",
        ("macos", "x86_64") => "macos-x64.xz",
        ("macos", "aarch64") => "macos-arm64.xz",
        ("windows", "x86_64") => "win-x64.zip",
        ("windows", "x86") => "win-x86.zip",
        ("windows", "aarch64") => "win-arm64.zip",
        _ => {
            return Err(Error::Config(format!(
                "unsupported platform for par2 download: {os}/{arch}"
            )));
        }
    };
    Ok(suffix)
}

/// Download the latest prebuilt par2 executable into the current
/// directory and return its path.
///
/// TODO: the release assets are .xz/.zip archives; the bytes are written
/// verbatim to `par2cmd` without extraction, so the result is only
/// directly runnable once extraction is added here or upstream ships raw
/// binaries.
pub async fn download_par2_cmd() -> Result<PathBuf> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("nzb-repair/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let release: Release = client
        .get(RELEASE_URL)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let suffix = asset_suffix(os, arch)?;

    let asset = release
        .assets
        .iter()
        .find(|a| a.name.ends_with(suffix))
        .ok_or_else(|| {
            Error::Config(format!(
                "release {} has no asset for {os}/{arch} (wanted *{suffix})",
                release.tag_name
            ))
        })?;

    debug!(asset = %asset.name, tag = %release.tag_name, "downloading par2 executable");

    let bytes = client
        .get(&asset.browser_download_url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    let path = PathBuf::from(PAR2_CMD_NAME);
    tokio::fs::write(&path, &bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    info!(asset = %asset.name, path = %path.display(), "downloaded par2 executable");
    Ok(path)
}

/// Resolve the par2 executable to use: the configured path when it
/// exists, then the conventional local path, then a PATH lookup, and
/// finally a fresh download.
pub async fn ensure_par2_executable(cfg: &Config) -> Result<PathBuf> {
    if let Some(configured) = &cfg.par2_exe {
        if configured.exists() {
            debug!(path = %configured.display(), "using configured par2 executable");
            return Ok(configured.clone());
        }
        warn!(
            path = %configured.display(),
            "configured par2 executable not found, falling back"
        );
    }

    let default_path = Path::new(DEFAULT_PAR2_EXE);
    if default_path.exists() {
        info!(path = %default_path.display(), "par2 executable found at default path");
        return Ok(default_path.to_path_buf());
    }

    if let Ok(found) = which::which("par2") {
        info!(path = %found.display(), "par2 executable found on PATH");
        return Ok(found);
    }

    info!("no par2 executable configured or found, downloading par2cmdline-turbo");
    download_par2_cmd().await
}
