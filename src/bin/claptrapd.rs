//! claptrapd - always-on clap detector publishing to MQTT.
//!
//! This daemon:
//! 1. Loads the settings snapshot (file + environment)
//! 2. Selects one audio source and starts supervised detection
//! 3. Publishes `on` to the source topic for every detected clap
//! 4. Stops cleanly on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use claptrap::{
    DefaultAdapters, DetectionOrchestrator, DetectionRequest, EnergyBackendFactory,
    EventPublisher, Settings, SourceDescriptor, VbanFeed,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Acoustic clap detector with MQTT output")]
struct Args {
    /// Path to the JSON settings file.
    #[arg(long, env = "CLAPTRAP_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log filter (overrides the settings file, e.g. "debug" or "claptrap=trace").
    #[arg(long)]
    log_level: Option<String>,

    /// Disable Home Assistant discovery (publish raw events only).
    #[arg(long, env = "CLAPTRAP_NO_DISCOVERY")]
    no_discovery: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = match &args.settings {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    let level = args
        .log_level
        .clone()
        .or_else(|| settings.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    log::info!(
        "claptrapd {} starting (broker {}:{})",
        env!("CARGO_PKG_VERSION"),
        settings.mqtt.host,
        settings.mqtt.port
    );

    let request = DetectionRequest::from_settings(&settings.global);
    let publisher = Arc::new(EventPublisher::mqtt(&settings.mqtt));
    let vban = Arc::new(VbanFeed::new());
    let adapters = DefaultAdapters::new(settings.tools.clone(), vban);

    if let Some(SourceDescriptor::Vban { ip, .. }) = claptrap::select_source(&settings) {
        log::warn!(
            "VBAN source {} selected; frames only arrive once a receiver feeds the shared VbanFeed",
            ip
        );
    }

    let mut orchestrator = DetectionOrchestrator::new(
        settings,
        publisher.clone(),
        Arc::new(EnergyBackendFactory),
        Arc::new(adapters),
    );
    if args.no_discovery {
        orchestrator = orchestrator.without_discovery();
    }

    orchestrator
        .try_start(request)
        .map_err(|e| anyhow!("failed to start detection: {:#}", e))?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("claptrapd running, waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping detection...");

    let stopped = orchestrator.stop();
    if !orchestrator.wait_stopped(SHUTDOWN_GRACE) {
        log::warn!(
            "detection loop did not exit within {:?}, exiting anyway",
            SHUTDOWN_GRACE
        );
    }
    publisher.disconnect();

    if stopped {
        Ok(())
    } else {
        Err(anyhow!("detection teardown reported errors"))
    }
}
