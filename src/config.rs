//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, RoadsenseError};
use crate::station::parse_station;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub survey: SurveyConfig,
}

/// Device link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    /// Device nodes tried in order during discovery
    #[serde(default = "default_device_paths")]
    pub device_paths: Vec<String>,

    /// Name reported once connected
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    #[serde(default = "default_discovery_poll_ms")]
    pub discovery_poll_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

/// Line decoder configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DecoderConfig {
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

/// Ingestion pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: usize,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Survey data storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Diagnostic log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Directory for daily log files; empty logs to stderr only
    #[serde(default)]
    pub log_dir: String,

    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Survey run started by the headless runner
#[derive(Debug, Deserialize, Clone)]
pub struct SurveyConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,

    #[serde(default)]
    pub location: String,

    #[serde(default = "default_segment_name")]
    pub segment_name: String,

    #[serde(default = "default_start_sta")]
    pub start_sta: String,

    #[serde(default)]
    pub design_length_m: f64,

    #[serde(default)]
    pub surveyor: String,

    #[serde(default)]
    pub weather: String,
}

// Default value functions
fn default_device_paths() -> Vec<String> {
    crate::transport::DEFAULT_DEVICE_PATHS
        .iter()
        .map(|p| p.to_string())
        .collect()
}
fn default_device_name() -> String { "ESP32-Roadsense".to_string() }
fn default_baud_rate() -> u32 { crate::transport::DEFAULT_BAUD_RATE }
fn default_discovery_timeout_ms() -> u64 { 10000 }
fn default_discovery_poll_ms() -> u64 { 500 }
fn default_heartbeat_timeout_ms() -> u64 { 5000 }
fn default_reconnect_interval_ms() -> u64 { 3000 }
fn default_read_buffer_size() -> usize { 512 }

fn default_max_line_length() -> usize { crate::protocol::packet::DEFAULT_MAX_LINE_LENGTH }

fn default_batch_size() -> usize { 25 }
fn default_flush_interval_ms() -> u64 { 500 }
fn default_max_pending_batches() -> usize { 8 }
fn default_event_capacity() -> usize { 1024 }

fn default_data_dir() -> String { "./survey-data".to_string() }

fn default_log_level() -> String { "info".to_string() }

fn default_project_name() -> String { "Road survey".to_string() }
fn default_segment_name() -> String { "Segment 1".to_string() }
fn default_start_sta() -> String { crate::station::ZERO_STATION.to_string() }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_paths: default_device_paths(),
            device_name: default_device_name(),
            baud_rate: default_baud_rate(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            discovery_poll_ms: default_discovery_poll_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_pending_batches: default_max_pending_batches(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: String::new(),
            level: default_log_level(),
        }
    }
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            location: String::new(),
            segment_name: default_segment_name(),
            start_sta: default_start_sta(),
            design_length_m: 0.0,
            surveyor: String::new(),
            weather: String::new(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> RoadsenseError {
    RoadsenseError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use roadsense_logger::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Link
        if self.link.device_paths.is_empty() || self.link.device_paths.iter().any(|p| p.is_empty()) {
            return Err(invalid("device_paths must list at least one non-empty path"));
        }

        if ![9600, 57600, 115200, 230400, 460800, 921600].contains(&self.link.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 57600, 115200, 230400, 460800, 921600",
            ));
        }

        if self.link.discovery_timeout_ms == 0 || self.link.discovery_timeout_ms > 120000 {
            return Err(invalid("discovery_timeout_ms must be between 1 and 120000"));
        }

        if self.link.discovery_poll_ms == 0
            || self.link.discovery_poll_ms > self.link.discovery_timeout_ms
        {
            return Err(invalid(
                "discovery_poll_ms must be between 1 and discovery_timeout_ms",
            ));
        }

        if self.link.heartbeat_timeout_ms < 100 || self.link.heartbeat_timeout_ms > 60000 {
            return Err(invalid("heartbeat_timeout_ms must be between 100 and 60000"));
        }

        if self.link.reconnect_interval_ms == 0 || self.link.reconnect_interval_ms > 60000 {
            return Err(invalid("reconnect_interval_ms must be between 1 and 60000"));
        }

        if self.link.read_buffer_size == 0 {
            return Err(invalid("read_buffer_size must be greater than 0"));
        }

        // Decoder
        if self.decoder.max_line_length < 32 || self.decoder.max_line_length > 65536 {
            return Err(invalid("max_line_length must be between 32 and 65536"));
        }

        // Ingest
        if self.ingest.batch_size == 0 || self.ingest.batch_size > 10000 {
            return Err(invalid("batch_size must be between 1 and 10000"));
        }

        if self.ingest.flush_interval_ms == 0 || self.ingest.flush_interval_ms > 60000 {
            return Err(invalid("flush_interval_ms must be between 1 and 60000"));
        }

        if self.ingest.max_pending_batches == 0 {
            return Err(invalid("max_pending_batches must be greater than 0"));
        }

        if self.ingest.event_capacity == 0 {
            return Err(invalid("event_capacity must be greater than 0"));
        }

        // Storage
        if self.storage.data_dir.is_empty() {
            return Err(invalid("data_dir cannot be empty"));
        }

        // Survey
        if self.survey.project_name.trim().is_empty() {
            return Err(invalid("project_name cannot be empty"));
        }

        if parse_station(&self.survey.start_sta).is_err() {
            return Err(invalid(format!(
                "start_sta {:?} is not a valid station (expected km+m, e.g. 1+250)",
                self.survey.start_sta
            )));
        }

        if !self.survey.design_length_m.is_finite() || self.survey.design_length_m < 0.0 {
            return Err(invalid("design_length_m must be a non-negative number"));
        }

        Ok(())
    }
}
