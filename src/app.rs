//! Core application runner for the `beacon-link` binary.
//!
//! This module is decoupled from CLI parsing side effects and process exit
//! codes so the run loop can be driven by a fake transport in tests.

use crate::card_data::SentinelMode;
use crate::event::{ConnectionEvent, DiscoveryState, Event};
use crate::listener::ChannelListener;
use crate::manager::{BeaconManager, ManagerError};
use crate::output::OutputFormatter;
use crate::output::logfmt::LogfmtFormatter;
use crate::settings::{FileSettings, Settings, SettingsError, parse_duration};
use crate::transport::{EventStream, Transport, TransportError};
use clap::Parser;
use std::future::Future;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration for the run loop.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, about, version)]
pub struct Options {
    /// TOML file holding persisted settings. Created on first write.
    /// Without it, defaults are kept in memory.
    #[arg(long, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Filtered signal (dBm) above which a discovered beacon is connected.
    /// Clamped to -100..=0; 0 disables auto-connect.
    #[arg(long, value_name = "DBM", allow_negative_numbers = true)]
    pub auto_connect_threshold: Option<i64>,

    /// Signal (dBm) below which a connected beacon is disconnected.
    /// Clamped to -100..=0; 0 disables auto-disconnect.
    #[arg(long, value_name = "DBM", allow_negative_numbers = true)]
    pub auto_disconnect_threshold: Option<i64>,

    /// How long a beacon must stay weak before it is disconnected.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, value_parser = parse_duration)]
    pub auto_disconnect_interval: Option<Duration>,

    /// Stop scanning after this long. 0 scans until stopped.
    #[arg(long, value_parser = parse_duration)]
    pub scan_timeout: Option<Duration>,

    /// Sentinel framing applied to card data.
    #[arg(long, value_enum)]
    pub sentinel: Option<SentinelMode>,

    /// Card data written to every beacon once it is connected.
    #[arg(long, value_name = "TEXT")]
    pub card_data: Option<String>,

    /// Verbose output, log at debug level
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Open the configured settings store and apply command-line overrides.
///
/// Overrides go through the clamping setters, so a file-backed store
/// persists the values actually in effect.
pub fn load_settings(options: &Options) -> Result<Settings, SettingsError> {
    let mut settings = match &options.settings {
        Some(path) => Settings::new(Box::new(FileSettings::open(path)?)),
        None => Settings::in_memory(),
    };

    if let Some(value) = options.auto_connect_threshold {
        let stored = settings.set_auto_connect_threshold(value)?;
        debug!(requested = value, stored, "auto-connect threshold");
    }
    if let Some(value) = options.auto_disconnect_threshold {
        let stored = settings.set_auto_disconnect_threshold(value)?;
        debug!(requested = value, stored, "auto-disconnect threshold");
    }
    if let Some(interval) = options.auto_disconnect_interval {
        settings.set_auto_disconnect_interval(interval)?;
    }
    if let Some(timeout) = options.scan_timeout {
        settings.set_scan_timeout(timeout)?;
    }
    if let Some(mode) = options.sentinel {
        settings.set_sentinel_mode(mode)?;
    }
    Ok(settings)
}

fn write_event(
    formatter: &dyn OutputFormatter,
    event: &Event,
    out: &mut dyn Write,
) -> io::Result<()> {
    let line = formatter.format(event);
    writeln!(out, "{line}")
}

/// Run the manager, writing one formatted line per event to `out`.
///
/// - Scanning starts immediately and restarts whenever the radio becomes ready.
/// - With `--card-data`, every newly connected beacon is sent the text.
/// - Returns when the transport closes or `shutdown` completes.
pub async fn run_with_io(
    options: Options,
    transport: Box<dyn Transport>,
    events: EventStream,
    out: &mut dyn Write,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    let settings = load_settings(&options)?;
    info!(?settings, "starting beacon manager");
    let formatter = LogfmtFormatter::new();

    let manager = BeaconManager::spawn(transport, events, settings);
    let (listener, mut rx) = ChannelListener::new();
    manager.subscribe(listener);
    manager.start_scanning().await?;

    tokio::pin!(shutdown);
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = &mut shutdown => {
                info!("shutting down");
                manager.shutdown().await?;
                break;
            }
        };
        write_event(&formatter, &event, out)?;

        match &event {
            Event::DiscoveryStateChanged {
                old: DiscoveryState::NotReady,
                new: DiscoveryState::Inactive,
            } => {
                manager.start_scanning().await?;
            }
            Event::Connection {
                event: ConnectionEvent::Connect,
                beacon,
            } => {
                if let Some(text) = &options.card_data
                    && let Err(e) = manager.write_card_data(beacon.id(), text.as_str()).await
                {
                    warn!(device = %beacon.id(), error = %e, "card data not written");
                }
            }
            _ => {}
        }
    }

    Ok(())
}
