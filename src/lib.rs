//! # nzb-repair
//!
//! Repairs incomplete Usenet binary postings described by NZB manifests.
//!
//! An NZB manifest enumerates files split into numbered segments, each
//! posted as a separate article. When articles expire, the par2
//! redundancy files posted alongside the payload can rebuild the missing
//! bytes. This crate downloads what is still available, drives an
//! external par2 binary to reconstruct the damaged files, re-posts the
//! lost segments under fresh message-ids, and writes a repaired manifest
//! pointing at them.
//!
//! Two modes: a one-shot repair of a single manifest, and a watch mode
//! that feeds a durable job queue from filesystem events and periodic
//! scans.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Application entry points (single-shot and watch mode)
pub mod app;
/// Outgoing article codec
pub mod article;
/// Command-line interface
pub mod cli;
/// Typed configuration with defaulting
pub mod config;
/// Error types
pub mod error;
/// NNTP connection pool and its contract
pub mod nntp;
/// NZB manifest codec
pub mod nzb;
/// Par2 repair driver and binary fetcher
pub mod par2;
/// Persistent job queue
pub mod queue;
/// Per-NZB repair pipeline
pub mod repair;
/// Periodic recursive NZB discovery
pub mod scanner;
/// Watch-mode supervisor
pub mod supervisor;
/// Positional file I/O helpers
pub mod utils;
/// Filesystem-event NZB discovery
pub mod watcher;
/// yEnc encoding and decoding
pub mod yenc;

pub use config::{Config, ObfuscationPolicy, ProviderConfig};
pub use error::{Error, Par2Error, QueueError, Result};
pub use nntp::{ArticlePool, ConnectionPool, NntpError};
pub use nzb::{Nzb, NzbFile, Segment};
pub use par2::{Par2Cmd, Par2Runner};
pub use queue::{Job, JobStatus, Queue};
pub use repair::repair_nzb;
pub use supervisor::Supervisor;
