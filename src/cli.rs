//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Repair incomplete Usenet binary postings described by NZB manifests
#[derive(Debug, Parser)]
#[command(name = "nzb-repair", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output file (single mode) or base directory (watch mode)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Working directory root (default: system tmp)
    #[arg(long, global = true, value_name = "DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// NZB file to repair (one-shot mode)
    #[arg(value_name = "NZB_FILE")]
    pub nzb_file: Option<PathBuf>,

    /// Subcommand; absent for a one-shot repair
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Watch a directory and repair every NZB dropped into it
    Watch {
        /// Directory to watch
        #[arg(short, long, value_name = "DIR")]
        dir: PathBuf,

        /// Queue store path
        #[arg(short = 'b', long = "db", value_name = "FILE", default_value = "queue.db")]
        db: PathBuf,
    },
}
