//! Rootsmith - VM root filesystem builder
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use rootsmith::cli::{Cli, Commands, LogFormat};
use rootsmith::config::ConfigManager;
use rootsmith::error::RootsmithResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> RootsmithResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let mut config = config_manager.load().await?;
    config.apply_env();

    init_tracing(
        cli.verbose,
        cli.log_format
            .unwrap_or_else(|| LogFormat::from_config(&config.general.log_format)),
    );
    debug!(path = %config_manager.path().display(), "Configuration loaded");

    match cli.command {
        Commands::Build(args) => rootsmith::cli::commands::build(args, &config).await,
        Commands::Size(args) => rootsmith::cli::commands::size(args, &config).await,
        Commands::Config(args) => {
            rootsmith::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug
fn init_tracing(verbose: u8, format: LogFormat) {
    let filter = match verbose {
        0 => EnvFilter::new("rootsmith=warn"),
        1 => EnvFilter::new("rootsmith=info"),
        _ => EnvFilter::new("rootsmith=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.without_time().init(),
    }
}
