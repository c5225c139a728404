//! # Roadsense Logger
//!
//! Headless survey runner for an ESP32 road-survey unit.
//!
//! Creates a project and segment from the `[survey]` section, connects to
//! the unit, logs survey rows to JSON Lines files and keeps reconnecting if
//! the link drops. Ctrl+C completes the segment and exits.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use roadsense_logger::config::{Config, LoggingConfig};
use roadsense_logger::ingest::IngestionSink;
use roadsense_logger::link::{
    ErrorKind, LinkEvent, LinkManager, LinkState, ManagerConfig, StreamEnd,
};
use roadsense_logger::model::{Project, RoadSegment};
use roadsense_logger::storage::JsonlStore;
use roadsense_logger::transport::SerialConnector;

/// Configuration used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Log file name inside `[logging] log_dir`
const LOG_FILE: &str = "roadsense-logger.log";

/// Survey rows between status log messages
const LOG_INTERVAL_RECORDS: u64 = 100;

/// Main entry point for Roadsense Logger
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (first argument or `config/default.toml`)
///    - Set up logging, optionally with a daily log file
///    - Open the survey data directory and create the project and segment
///
/// 2. **Survey Loop**
///    - Connect, then start logging as soon as the unit is connected
///    - Reconnect every `reconnect_interval_ms` after a drop or failed attempt
///    - Log a status line every 100 survey rows
///
/// 3. **Graceful Shutdown**
///    - Stop logging, completing the segment
///    - Drain pending writes and release the link
///
/// # Errors
///
/// Returns error if the configuration is invalid or the data directory
/// cannot be created. Link failures are retried, not returned.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config_found = Path::new(&config_path).exists();
    let config = if config_found {
        Config::load(&config_path).with_context(|| format!("Failed to load {}", config_path))?
    } else {
        Config::default()
    };

    let _log_guard = init_logging(&config.logging)?;

    info!("Roadsense Logger v{} starting...", env!("CARGO_PKG_VERSION"));
    if config_found {
        info!("Configuration loaded from {}", config_path);
    } else {
        warn!("{} not found, using built-in defaults", config_path);
    }

    let store = Arc::new(
        JsonlStore::open(&config.storage.data_dir)
            .await
            .context("Failed to open survey data directory")?,
    );

    let survey = &config.survey;
    let project = Project::new(survey.project_name.clone())?.with_location(survey.location.clone());
    store.create_project(&project).await?;

    let segment = RoadSegment::new(
        project.id,
        survey.segment_name.clone(),
        survey.design_length_m,
        survey.start_sta.clone(),
    )?
    .with_surveyor(survey.surveyor.clone())
    .with_weather(survey.weather.clone());

    info!(
        "Project {:?}, segment {:?} from {} (design {:.0} m)",
        project.name, segment.name, segment.start_sta, segment.design_length_m
    );

    let connector = Arc::new(SerialConnector::new(
        config.link.device_paths.clone(),
        config.link.baud_rate,
        config.link.device_name.clone(),
    ));
    let manager = LinkManager::spawn(connector, store.clone(), ManagerConfig::from(&config));

    let mut events = manager.subscribe().await?;
    manager.open_segment(segment).await?;
    manager.connect().await?;

    let reconnect_interval = Duration::from_millis(config.link.reconnect_interval_ms);
    let mut reconnect_at: Option<Instant> = None;
    let mut resubscribe = false;
    let mut rows: u64 = 0;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Press Ctrl+C to finish the segment and exit");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::StateChanged(state)) => {
                    debug!("Link state: {}", state);
                    if state == LinkState::Connected && !manager.telemetry().logging {
                        if let Err(e) = manager.start_logging().await {
                            warn!("Failed to start logging: {}", e);
                        }
                    }
                }
                Ok(LinkEvent::DeviceConnected(name)) => info!("Connected to {}", name),
                Ok(LinkEvent::RecordReceived(row)) => {
                    rows += 1;
                    debug!(
                        "{} | {:.1} km/h | vib {:.3} | seq {}",
                        row.sta, row.speed_kmh, row.vibration_z, row.packet_count
                    );
                    if rows % LOG_INTERVAL_RECORDS == 0 {
                        let telemetry = manager.telemetry();
                        info!(
                            "Logged {} rows, station {}, trip {:.1} m, {} lines dropped",
                            rows,
                            telemetry.station,
                            telemetry.trip_distance_m,
                            telemetry.decoder.lines_dropped
                        );
                    }
                }
                Ok(LinkEvent::MessageReceived(text)) => info!("Device message: {}", text),
                Ok(LinkEvent::SegmentUpdated(segment)) => {
                    if segment.is_completed {
                        info!(
                            "Segment {:?} completed at {} ({:.0} m, {:+.1}% vs design)",
                            segment.name,
                            segment.end_sta,
                            segment.actual_length_m,
                            segment.difference_percentage()
                        );
                    }
                }
                Ok(LinkEvent::Error { kind, message }) => {
                    warn!("{:?}: {}", kind, message);
                    if matches!(
                        kind,
                        ErrorKind::Discovery | ErrorKind::Connect | ErrorKind::ConnectionLost | ErrorKind::Write
                    ) {
                        info!("Reconnecting in {} ms", reconnect_interval.as_millis());
                        reconnect_at = Some(Instant::now() + reconnect_interval);
                    }
                }
                Err(StreamEnd::Overflowed) => {
                    warn!("Event log fell behind and was disconnected, resubscribing");
                    resubscribe = true;
                }
                Err(StreamEnd::Closed) => break,
            },

            // Retry the link after a failure
            _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                reconnect_at = None;
                if let Err(e) = manager.connect().await {
                    warn!("Reconnect failed: {}", e);
                }
            }

            // Handle Ctrl+C for graceful shutdown
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }

        if resubscribe {
            events = manager.subscribe().await?;
            resubscribe = false;
        }
    }

    if let Err(e) = manager.stop_logging().await {
        warn!("Failed to stop device logging: {}", e);
    }
    if let Some(segment) = manager.close_segment().await? {
        info!("Segment {:?} closed at {}", segment.name, segment.end_sta);
    }
    manager.cleanup().await?;

    let telemetry = manager.telemetry();
    info!(
        "Total rows logged: {} (trip {:.1} m, {} lost packets)",
        rows, telemetry.trip_distance_m, telemetry.decoder.lost_packets
    );
    info!("Survey data written to {}", store.root().display());

    Ok(())
}

/// Install the stderr logger and, when `log_dir` is set, a daily log file
///
/// `RUST_LOG` overrides the configured level. The returned guard must live
/// until exit so buffered file output is flushed.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if config.log_dir.is_empty() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {}", config.log_dir))?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, LOG_FILE);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(Some(file_guard))
}
