use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use nzb_repair::app;
use nzb_repair::cli::{Cli, Command};
use nzb_repair::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let Some(config_path) = cli.config.as_deref() else {
        error!("--config is required");
        return ExitCode::FAILURE;
    };
    let cfg = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    // Shared cancellation token, cancelled by SIGINT/SIGTERM
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        app::wait_for_signal().await;
        signal_token.cancel();
    });

    let result = match cli.command {
        Some(Command::Watch { dir, db }) => {
            app::run_watch(
                token,
                cfg,
                &dir,
                &db,
                cli.output.as_deref(),
                cli.tmp_dir.as_deref(),
            )
            .await
        }
        None => {
            let Some(nzb_file) = cli.nzb_file else {
                error!("an NZB file argument is required outside watch mode");
                return ExitCode::FAILURE;
            };
            app::run_single_repair(
                token,
                cfg,
                &nzb_file,
                cli.output.as_deref(),
                cli.tmp_dir.as_deref(),
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nzb_repair={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
