//! # Device Link Transport
//!
//! Handles the serial-profile link to the ESP32 survey unit.
//!
//! This module handles:
//! - Discovering the device node of a paired unit (e.g. `/dev/rfcomm0`)
//! - Opening the port with 8N1 framing
//! - Async chunked reads and command writes
//!
//! The link manager only sees the [`Connector`] and [`LinkTransport`]
//! traits, so tests drive it with in-memory links.

pub mod port_trait;

pub use port_trait::{Connector, DeviceCandidate, LinkTransport};

use async_trait::async_trait;
use std::io;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::error::{Result, RoadsenseError};

/// Default baud rate of the ESP32 serial profile
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default device nodes to try (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/rfcomm0", // Bound Bluetooth serial-profile link
    "/dev/ttyUSB0", // USB-to-serial adapters (bench testing)
];

/// Discovers survey units among configured device nodes
#[derive(Debug, Clone)]
pub struct SerialConnector {
    paths: Vec<String>,
    baud_rate: u32,
    device_name: String,
}

impl SerialConnector {
    /// Create a connector over `paths`
    ///
    /// `device_name` is reported to subscribers; when empty the file name of
    /// the device node is used.
    pub fn new(paths: Vec<String>, baud_rate: u32, device_name: impl Into<String>) -> Self {
        Self {
            paths,
            baud_rate,
            device_name: device_name.into(),
        }
    }

    /// Connector over [`DEFAULT_DEVICE_PATHS`]
    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_DEVICE_PATHS.iter().map(|p| p.to_string()).collect(),
            DEFAULT_BAUD_RATE,
            "",
        )
    }

    /// Device nodes probed during discovery
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    fn candidate_name(&self, path: &str) -> String {
        if !self.device_name.is_empty() {
            return self.device_name.clone();
        }
        Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string())
    }

    /// Open a specific port with 8N1 settings
    fn open_port(&self, path: &str) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| RoadsenseError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn discover(&self) -> Result<Option<DeviceCandidate>> {
        for path in &self.paths {
            debug!("Probing device node: {}", path);

            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                let name = self.candidate_name(path);
                info!("Found survey device {} at {}", name, path);
                return Ok(Some(DeviceCandidate {
                    address: path.clone(),
                    name,
                }));
            }
        }

        Ok(None)
    }

    async fn open(&self, device: &DeviceCandidate) -> Result<Box<dyn LinkTransport>> {
        let port = self.open_port(&device.address)?;
        info!("Opened serial link to {} at {}", device.name, device.address);
        Ok(Box::new(SerialTransport { port }))
    }
}

/// Open serial port to a survey unit
pub struct SerialTransport {
    port: tokio_serial::SerialStream,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl LinkTransport for SerialTransport {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(&mut self.port, data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        AsyncWriteExt::flush(&mut self.port).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.port.shutdown().await
    }
}
