//! # Protocol Constants and Types
//!
//! Core definitions for the survey unit's line protocol.
//!
//! ```text
//! speed_kmh,odometer_m,trip_m,vibration_z,latitude,longitude,seq\n
//! #message text\n
//! ```

/// Line terminator
pub const LINE_TERMINATOR: u8 = b'\n';

/// Field separator inside a telemetry line
pub const FIELD_SEPARATOR: char = ',';

/// Prefix marking a device text message
pub const MESSAGE_PREFIX: char = '#';

/// Message body the device sends as a keep-alive
pub const HEARTBEAT_MESSAGE: &str = "HB";

/// Number of fields in a telemetry line
pub const TELEMETRY_FIELD_COUNT: usize = 7;

/// Default bound on buffered bytes without a terminator
pub const DEFAULT_MAX_LINE_LENGTH: usize = 256;

/// Host command: begin streaming telemetry
pub const CMD_START: &str = "START";

/// Host command: hold streaming, keep the link
pub const CMD_PAUSE: &str = "PAUSE";

/// Host command: end the current run
pub const CMD_STOP: &str = "STOP";

/// One telemetry sample as reported by the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTelemetry {
    /// Ground speed in km/h
    pub speed_kmh: f32,

    /// Cumulative odometer in meters
    pub odometer_m: f64,

    /// Device-side trip distance in meters
    pub trip_distance_m: f64,

    /// Vertical vibration amplitude
    pub vibration_z: f32,

    /// Latitude in degrees (0.0 without fix)
    pub latitude: f64,

    /// Longitude in degrees (0.0 without fix)
    pub longitude: f64,

    /// Packet sequence counter
    pub sequence: u32,
}

/// Host-to-device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Start,
    Pause,
    Stop,
}

impl DeviceCommand {
    /// Wire keyword for the command
    pub fn keyword(self) -> &'static str {
        match self {
            DeviceCommand::Start => CMD_START,
            DeviceCommand::Pause => CMD_PAUSE,
            DeviceCommand::Stop => CMD_STOP,
        }
    }
}

/// One unit produced by the decoder
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// A telemetry sample
    Telemetry(RawTelemetry),

    /// A device text message (without the `#` prefix)
    Message(String),

    /// A keep-alive line
    Heartbeat,

    /// Unterminated input exceeded the line bound and was discarded
    Overflow { discarded: usize },
}

/// Running decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Telemetry lines decoded
    pub frames_decoded: u64,

    /// Lines dropped for field count or number errors
    pub lines_dropped: u64,

    /// Buffer resets due to missing terminators
    pub overflows: u64,

    /// Sequence numbers seen twice in a row
    pub duplicates: u64,

    /// Sequence numbers skipped
    pub lost_packets: u64,

    /// Sequence counter went backwards (device restart)
    pub sequence_resets: u64,
}
