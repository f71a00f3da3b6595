//! Process entry point for the distributed worker.
//!
//! `matrix-worker <Address:Port> [ConfigFile]` — binds the address, serves
//! requests under the configured scheduling variant, and parks until an
//! external shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use matrix_worker::config::{Cli, ConfigSource, PathsConfig, WorkerConfig, DEFAULT_CONFIG_FILE};
use matrix_worker::device::DeviceContext;
use matrix_worker::worker::WorkerService;

fn init_tracing(paths: &PathsConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "matrix_worker=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if let Some(path) = &paths.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!(
                "Failed to open log file {}: {e}; logging to stderr",
                path.display()
            ),
        }
    }

    builder.with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            e.exit()
        }
        Err(_) => {
            let binary = std::env::args()
                .next()
                .unwrap_or_else(|| "matrix-worker".to_string());
            println!("{}", Cli::usage(&binary));
            std::process::exit(1);
        }
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let (mut config, config_source) = WorkerConfig::load(&config_path);
    config.resolve_lib_dir();

    // The logging destination comes from the config, so the subscriber can
    // only start now; the load outcome is reported right after.
    init_tracing(&config.paths);

    info!("matrix-worker v{}", env!("CARGO_PKG_VERSION"));
    match &config_source {
        ConfigSource::File => {
            info!(path = %config_path.display(), "Configuration loaded")
        }
        ConfigSource::DefaultsFileMissing => {
            warn!(path = %config_path.display(), "Config file not found, using defaults")
        }
        ConfigSource::DefaultsLoadFailed(reason) => {
            error!(path = %config_path.display(), reason = %reason, "Failed to load config, using defaults")
        }
    }
    info!(lib_dir = %config.paths.lib_dir.display(), "Resolved library directory");

    let config = Arc::new(config);
    let ctx = Arc::new(DeviceContext::detect(&config.device));
    info!(
        device = %ctx.info().name,
        total_memory = ctx.info().total_memory,
        "Device context ready"
    );

    let mut service = WorkerService::bind(&cli.address, config, ctx)?;
    service.serve()?;

    println!("Started distributed worker on `{}`", cli.address);

    tokio::select! {
        _ = service.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            service.shutdown();
            service.wait().await;
        }
    }

    Ok(())
}
