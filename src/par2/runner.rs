//! External par2 repair driver
//!
//! Picks any `.par2` file in the working directory, runs the external
//! binary with `r -q -p` from that directory, streams progress from
//! stdout, and maps exit codes to named errors. The subprocess launch is
//! injectable so tests can swap in a stand-in that prints fixed output
//! and exits with a chosen code.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Par2Error;

/// Progress percentage in par2 output, e.g. `42%` or `99.12%`
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.?\d*%").expect("valid regex"));

/// Exit codes documented by par2cmdline
const PAR2_EXIT_CODES: &[(i32, &str)] = &[
    (1, "Repair possible"),
    (2, "Repair not possible"),
    (3, "Invalid command line arguments"),
    (4, "Insufficient critical data to verify"),
    (5, "Repair failed"),
    (6, "FileIO error"),
    (7, "Logic error"),
    (8, "Out of memory"),
];

/// Repair seam used by the pipeline and the supervisor
#[async_trait]
pub trait Par2Runner: Send + Sync {
    /// Repair the contents of a working directory in place.
    ///
    /// Succeeds without side effects when the directory holds no `.par2`
    /// file — nothing to verify against.
    async fn repair(&self, token: &CancellationToken, dir: &Path) -> Result<(), Par2Error>;
}

/// Builds the subprocess invocation; swapped out by tests
type CommandBuilder = dyn Fn(&Path, &Path, &Path) -> Command + Send + Sync;

/// Driver for the external par2 binary
pub struct Par2Cmd {
    exe_path: PathBuf,
    build_command: Box<CommandBuilder>,
}

impl Par2Cmd {
    /// Driver using the real binary at `exe_path`
    pub fn new(exe_path: PathBuf) -> Self {
        Self {
            exe_path,
            build_command: Box::new(|exe, dir, par2_file| {
                let mut cmd = Command::new(exe);
                cmd.args(["r", "-q", "-p"])
                    .arg(par2_file)
                    .current_dir(dir)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                cmd
            }),
        }
    }

    /// Driver with an injected launch function (tests)
    pub fn with_command_builder<F>(exe_path: PathBuf, build_command: F) -> Self
    where
        F: Fn(&Path, &Path, &Path) -> Command + Send + Sync + 'static,
    {
        Self {
            exe_path,
            build_command: Box::new(build_command),
        }
    }

    fn find_par2_file(dir: &Path) -> Option<PathBuf> {
        for entry in walkdir::WalkDir::new(dir).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.to_ascii_lowercase().ends_with(".par2") {
                return Some(entry.into_path());
            }
        }
        None
    }
}

#[async_trait]
impl Par2Runner for Par2Cmd {
    async fn repair(&self, token: &CancellationToken, dir: &Path) -> Result<(), Par2Error> {
        let par2_file = match Self::find_par2_file(dir) {
            Some(path) => path,
            None => {
                info!(dir = %dir.display(), "no par2 file present, nothing to repair");
                return Ok(());
            }
        };

        info!(par2 = %par2_file.display(), "starting repair process");

        let mut cmd = (self.build_command)(&self.exe_path, dir, &par2_file);
        let mut child = cmd.spawn().map_err(Par2Error::Spawn)?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let stdout_task = async {
            let Some(out) = stdout.as_mut() else {
                return;
            };
            let mut splitter = LineSplitter::default();
            let mut chunk = [0u8; 4096];
            loop {
                match out.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for line in splitter.push(&chunk[..n]) {
                            report_line(&line);
                        }
                    }
                }
            }
            if let Some(line) = splitter.finish() {
                report_line(&line);
            }
        };

        let stderr_task = async {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let wait_task = async {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    None
                }
                status = child.wait() => Some(status),
            }
        };

        let ((), stderr_text, status) = tokio::join!(stdout_task, stderr_task, wait_task);

        let status = match status {
            Some(status) => status.map_err(Par2Error::Spawn)?,
            None => return Ok(()), // cancelled; treated as graceful shutdown
        };

        if status.success() {
            info!("repair successful");
            return Ok(());
        }

        match status.code() {
            Some(code) => match PAR2_EXIT_CODES.iter().find(|(c, _)| *c == code) {
                Some((_, name)) => Err(Par2Error::ExitStatus {
                    code,
                    name,
                    stderr: stderr_text,
                }),
                None => Err(Par2Error::UnknownExitStatus {
                    code,
                    stderr: stderr_text,
                }),
            },
            None => Err(Par2Error::Terminated {
                stderr: stderr_text,
            }),
        }
    }
}

fn report_line(line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if let Some(cap) = PROGRESS_RE.captures(line) {
        if let Ok(percent) = cap[1].parse::<u32>() {
            debug!(percent, "repair progress");
        }
        return;
    }
    debug!("par2: {line}");
}

/// Incremental line splitter recognizing `\n`, `\r\n`, and bare `\r`
/// (par2 redraws its progress display with carriage returns).
#[derive(Default)]
struct LineSplitter {
    buf: Vec<u8>,
    pending_cr: bool,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                self.buf.clear();
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => {
                    lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                    self.buf.clear();
                }
                b'\r' => self.pending_cr = true,
                other => self.buf.push(other),
            }
        }
        lines
    }

    fn finish(mut self) -> Option<String> {
        if self.pending_cr || !self.buf.is_empty() {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        } else {
            None
        }
    }
}
