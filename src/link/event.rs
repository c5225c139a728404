//! Events published by the link manager

use super::state::LinkState;
use crate::model::{RoadSegment, SurveyData};

/// Category of a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No device appeared within the discovery window
    Discovery,
    /// The transport refused the connection
    Connect,
    /// The link dropped (read failure, hang-up or heartbeat timeout)
    ConnectionLost,
    /// A command could not be written to the device
    Write,
    /// Unterminated input was discarded by the decoder
    FrameOverflow,
    /// Survey rows or segment updates could not be persisted
    Persistence,
}

/// Ordered notification delivered to every subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    DeviceConnected(String),
    RecordReceived(SurveyData),
    MessageReceived(String),
    SegmentUpdated(RoadSegment),
    Error { kind: ErrorKind, message: String },
}

impl LinkEvent {
    pub(crate) fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        LinkEvent::Error {
            kind,
            message: message.into(),
        }
    }
}
