//! Trait abstraction for the device link to enable testing

use async_trait::async_trait;
use std::io;

use crate::error::Result;

/// A device found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    /// Address used to open the link (device node, MAC, ...)
    pub address: String,
    /// Name reported to subscribers once connected
    pub name: String,
}

/// Bidirectional byte stream to a connected device
#[async_trait]
pub trait LinkTransport: Send {
    /// Read the next chunk into `buf`; `Ok(0)` means the peer hung up
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all data to the link
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Release the link
    async fn close(&mut self) -> io::Result<()>;
}

/// Finds devices and opens links to them
#[async_trait]
pub trait Connector: Send + Sync {
    /// One discovery pass; `None` when no device is visible yet
    async fn discover(&self) -> Result<Option<DeviceCandidate>>;

    /// Open a link to a discovered device
    async fn open(&self, device: &DeviceCandidate) -> Result<Box<dyn LinkTransport>>;
}
