//! tsrec-recorder: recording device orchestration service.
//!
//! Creates the configured devices, runs the activity scheduler and keeps
//! going until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use tsrec_recorder::callback::{CallbackConnector, LogCallbackConnector};
use tsrec_recorder::config::{CallbackKind, RecorderConfig, DEFAULT_CONFIG_FILE};
use tsrec_recorder::device::rtp::RtpDeviceFactory;
use tsrec_recorder::logging;
use tsrec_recorder::scheduler::sleep::{self, SleepInhibitor};
use tsrec_recorder::RecordingService;

/// tsrec-recorder - Recording device orchestration service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored (overrides the config file)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files (overrides the config file)
    #[arg(long)]
    log_retention_days: Option<u64>,
}

fn connector(config: &RecorderConfig) -> Arc<dyn CallbackConnector> {
    match config.callback.kind {
        CallbackKind::Log => Arc::new(LogCallbackConnector),
        #[cfg(feature = "webhook")]
        CallbackKind::Webhook => Arc::new(tsrec_recorder::callback::WebhookConnector::new(
            config.callback.path.clone(),
        )),
        #[cfg(not(feature = "webhook"))]
        CallbackKind::Webhook => {
            warn!("Webhook callbacks are not compiled in, logging events instead");
            Arc::new(LogCallbackConnector)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match RecorderConfig::load(&args.config) {
        Ok(config) => {
            eprintln!("Loaded config from: {}", args.config.display());
            config
        }
        Err(e) => {
            eprintln!("Failed to load config file: {}", e);
            return Err(e.into());
        }
    };

    // Command line takes precedence
    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| config.logging.log_dir.clone());
    let retention_days = args
        .log_retention_days
        .unwrap_or(config.logging.retention_days);
    let _log_guard = logging::init_logging(
        &log_dir,
        retention_days,
        args.verbose,
        &config.logging.level,
    )
    .expect("Failed to initialize logging");

    info!("tsrec-recorder {} starting...", env!("CARGO_PKG_VERSION"));
    info!("  Devices: {}", config.devices.names.join(", "));
    info!("  RTP bind: {}", config.devices.rtp.bind);
    if let Some(dir) = config.recording_directory() {
        info!("  Recording directory: {}", dir.display());
    }
    info!("  Sleep inhibitor: {:?}", config.scheduler.sleep_inhibitor);

    let factory = RtpDeviceFactory::new(config.devices.rtp.bind);
    let callbacks = connector(&config);
    let inhibitor: Arc<dyn SleepInhibitor> = Arc::from(sleep::inhibitor(config.scheduler.sleep_inhibitor));

    let service = match RecordingService::new(config, &factory, callbacks, inhibitor) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to create recording service: {}", e);
            return Err(e.into());
        }
    };
    service.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    service.shutdown().await;
    info!("tsrec-recorder stopped");

    Ok(())
}
