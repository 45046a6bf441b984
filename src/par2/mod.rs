//! Par2 repair driver and binary fetcher

mod fetch;
mod runner;

pub use fetch::{download_par2_cmd, ensure_par2_executable};
pub use runner::{Par2Cmd, Par2Runner};
