#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use outflow::{Daemon, find_config_file};
use outflow_common::{internal, logging};

/// Log daemon that delivers records to pluggable outputs
#[derive(Parser, Debug)]
#[command(name = "outflow")]
#[command(about = "Deliver log records read from stdin to the configured actions", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind every configured action, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let config_path = find_config_file(cli.config)?;
    internal!(level = INFO, "Using configuration {}", config_path.display());
    let daemon = Daemon::start(config_path)?;

    if cli.check {
        internal!(
            level = INFO,
            "Configuration OK, {} actions bound",
            daemon.registry().active().len()
        );
        daemon.stop();
        return Ok(());
    }

    Arc::new(daemon).run().await
}
