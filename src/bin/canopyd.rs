//! canopyd - folder-watching image analysis daemon
//!
//! This daemon:
//! 1. Loads the options document (Home Assistant add-on shape)
//! 2. Starts configured image sources and frame processors
//! 3. Announces every sensor via MQTT discovery
//! 4. Polls sources and publishes results until a shutdown signal arrives

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use canopy_sense::config::ServiceConfig;
use canopy_sense::coordinator::Coordinator;

const DEFAULT_OPTIONS_PATH: &str = "/data/options.json";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Watch image folders and publish canopy metrics over MQTT"
)]
struct Args {
    /// Path to the options document.
    #[arg(long, env = "CANOPY_CONFIG", default_value = DEFAULT_OPTIONS_PATH)]
    config: PathBuf,

    /// Override the configured log level (error|warn|info|debug|trace).
    #[arg(long, env = "CANOPY_LOG_LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("load options from {}", args.config.display()))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();

    log::info!("canopyd {} starting", env!("CARGO_PKG_VERSION"));

    // The coordinator never observes signals directly; it only sees the
    // cooperative stop below.
    let stop_requested = Arc::new(AtomicBool::new(false));
    {
        let stop_requested = Arc::clone(&stop_requested);
        ctrlc::set_handler(move || {
            stop_requested.store(true, Ordering::SeqCst);
        })
        .context("install signal handler")?;
    }

    let mut coordinator = Coordinator::new(&config);
    coordinator.start().context("start coordinator")?;
    log::info!("canopyd running");

    while !stop_requested.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
    }

    log::info!("shutdown signal received");
    coordinator.stop();
    Ok(())
}
