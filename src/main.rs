//! Fieldpoll - roadside device communication daemon
//!
//! Opens every configured link, pushes settings, keeps detector listeners
//! running and polls device status on a schedule until interrupted.

use anyhow::Context;
use clap::Parser;
use fieldpoll_core::config::{self, AppConfig};
use fieldpoll_core::core::comm::{CommEvent, Device, DeviceKind, Dispatcher, PriorityClass};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Fieldpoll daemon
#[derive(Parser, Debug)]
#[command(name = "fieldpoll", version, about = "Roadside device communication daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "FIELDPOLL_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (overrides the configured level)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    /// Skip the startup settings push
    #[arg(long)]
    no_settings: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut app = match &args.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load().context("loading default configuration")?,
    };
    if let Some(level) = &args.log_level {
        app.logging.level = level.clone();
    }
    app.logging.json |= args.json;
    if args.no_settings {
        app.polling.send_settings_on_start = false;
    }

    let _guard = config::init_logging(&app.logging)?;
    tracing::info!("Starting fieldpoll v{}", env!("CARGO_PKG_VERSION"));

    let dispatcher = Arc::new(app.start(1024).context("starting links")?);
    tracing::info!(
        "{} links, {} devices",
        app.links.len(),
        dispatcher.device_names().len()
    );

    let logger = tokio::spawn(log_events(dispatcher.subscribe()));
    startup(&dispatcher, &app);
    let poller = tokio::spawn(poll_loop(Arc::clone(&dispatcher), app.polling.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutting down");

    poller.abort();
    dispatcher.shutdown().await;
    logger.abort();
    Ok(())
}

fn devices(dispatcher: &Dispatcher) -> Vec<Arc<Device>> {
    dispatcher
        .device_names()
        .iter()
        .filter_map(|name| dispatcher.device(name))
        .collect()
}

fn startup(dispatcher: &Dispatcher, app: &AppConfig) {
    for device in devices(dispatcher) {
        if !matches!(device.kind(), DeviceKind::RampMeter(_)) {
            continue;
        }
        let name = device.name();
        if app.polling.send_settings_on_start {
            if let Err(e) = dispatcher.send_settings(name) {
                tracing::warn!("{}: send settings: {}", name, e);
            }
        }
        if app.polling.listen_detectors {
            if let Err(e) = dispatcher.listen_detectors(name) {
                tracing::warn!("{}: listen: {}", name, e);
            }
        }
    }
}

async fn poll_loop(dispatcher: Arc<Dispatcher>, polling: config::PollingConfig) {
    let secs = |s: u64| Duration::from_secs(s.max(1));
    let mut high = tokio::time::interval(secs(polling.high_interval_secs));
    let mut low = tokio::time::interval(secs(polling.low_interval_secs));
    let mut feed = tokio::time::interval(secs(polling.feed_interval_secs));

    loop {
        tokio::select! {
            _ = high.tick() => poll_meters(&dispatcher, PriorityClass::PollHigh),
            _ = low.tick() => poll_low(&dispatcher),
            _ = feed.tick() => poll_feeds(&dispatcher),
        }
    }
}

fn poll_meters(dispatcher: &Dispatcher, priority: PriorityClass) {
    for device in devices(dispatcher) {
        if let DeviceKind::RampMeter(_) = device.kind() {
            if let Err(e) = dispatcher.query_status(device.name(), priority) {
                tracing::debug!("{}: query status: {}", device.name(), e);
            }
        }
    }
}

fn poll_low(dispatcher: &Dispatcher) {
    for device in devices(dispatcher) {
        if let DeviceKind::RampMeter(_) = device.kind() {
            if let Err(e) = dispatcher.query_firmware(device.name(), PriorityClass::PollLow) {
                tracing::debug!("{}: query firmware: {}", device.name(), e);
            }
        }
    }
}

fn poll_feeds(dispatcher: &Dispatcher) {
    for device in devices(dispatcher) {
        if let DeviceKind::AlertFeed { .. } = device.kind() {
            if let Err(e) = dispatcher.fetch_feed(device.name(), PriorityClass::PollLow) {
                tracing::debug!("{}: fetch feed: {}", device.name(), e);
            }
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<CommEvent>) {
    loop {
        match rx.recv().await {
            Ok(CommEvent::Updated { device, update }) => {
                tracing::info!("{} UPDATE {:?}", device, update);
            }
            Ok(CommEvent::Completed { device, operation }) => {
                tracing::debug!("{} COMPLETED {}", device, operation);
            }
            Ok(CommEvent::CommError {
                device,
                operation,
                message,
            }) => {
                tracing::warn!("{} COMM ERROR {}: {}", device, operation, message);
            }
            Ok(CommEvent::ProtocolError {
                device,
                operation,
                message,
            }) => {
                tracing::warn!("{} PROTOCOL ERROR {}: {}", device, operation, message);
            }
            Ok(CommEvent::ConfigError {
                device,
                operation,
                message,
            }) => {
                tracing::error!("{} CONFIG ERROR {}: {}", device, operation, message);
            }
            Ok(CommEvent::Cancelled { device, operation }) => {
                tracing::debug!("{} CANCELLED {}", device, operation);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("event log lagged, {} events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
