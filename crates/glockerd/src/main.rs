//! Glocker Daemon - Access restriction enforcement
//!
//! Must run as root. Loads the policy, then hands over to the daemon loop.

use anyhow::{Context, Result};
use clap::Parser;
use glocker_common::config::CONFIG_PATH;
use glocker_common::{ConfigSource, GlockerError, SystemClock, YamlConfigSource};
use glockerd::{Daemon, System};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glockerd")]
#[command(about = "Glocker daemon - time-based access restrictions", long_about = None)]
#[command(version)]
struct Args {
    /// Config file (default: $GLOCKER_CONFIG or /etc/glocker/config.yaml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn config_path(args: &Args) -> PathBuf {
    args.config
        .clone()
        .or_else(|| std::env::var_os("GLOCKER_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let path = config_path(&args);
    let source = YamlConfigSource::new(&path);

    let config = match source.load() {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            error!("Cannot start: {}", e);
            return Err(e).context("Failed to load configuration");
        }
    };
    init_logging(&config.log_level);

    if !nix::unistd::geteuid().is_root() {
        let e = GlockerError::Privilege("glockerd must run as root".to_string());
        error!("{}", e);
        return Err(e.into());
    }

    info!("Using config {}", path.display());
    let daemon = Daemon::new(
        config,
        Arc::new(source),
        System::real(),
        Arc::new(SystemClock),
    );
    daemon.run().await
}
