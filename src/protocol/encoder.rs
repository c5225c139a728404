//! # Line Encoder
//!
//! Encodes host commands and telemetry samples into protocol lines.

use super::packet::*;

/// Encode a host command as a terminated line
///
/// # Examples
///
/// ```
/// use roadsense_logger::protocol::encoder::encode_command;
/// use roadsense_logger::protocol::packet::DeviceCommand;
///
/// assert_eq!(encode_command(DeviceCommand::Start), b"START\n".to_vec());
/// ```
pub fn encode_command(command: DeviceCommand) -> Vec<u8> {
    let keyword = command.keyword();
    let mut line = Vec::with_capacity(keyword.len() + 1);
    line.extend_from_slice(keyword.as_bytes());
    line.push(LINE_TERMINATOR);
    line
}

/// Encode a telemetry sample the way the survey unit sends it
///
/// Numbers use Rust's shortest round-trip formatting, so decoding the
/// line yields the same values.
pub fn encode_telemetry(sample: &RawTelemetry) -> Vec<u8> {
    let fields = [
        sample.speed_kmh.to_string(),
        sample.odometer_m.to_string(),
        sample.trip_distance_m.to_string(),
        sample.vibration_z.to_string(),
        sample.latitude.to_string(),
        sample.longitude.to_string(),
        sample.sequence.to_string(),
    ];

    let mut line = fields.join(&FIELD_SEPARATOR.to_string()).into_bytes();
    line.push(LINE_TERMINATOR);
    line
}

/// Encode a device text message line
pub fn encode_message(text: &str) -> Vec<u8> {
    format!("{}{}\n", MESSAGE_PREFIX, text).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawTelemetry {
        RawTelemetry {
            speed_kmh: 42.5,
            odometer_m: 1250.25,
            trip_distance_m: 310.0,
            vibration_z: 0.125,
            latitude: -6.2088,
            longitude: 106.8456,
            sequence: 17,
        }
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(encode_command(DeviceCommand::Start), b"START\n");
        assert_eq!(encode_command(DeviceCommand::Pause), b"PAUSE\n");
        assert_eq!(encode_command(DeviceCommand::Stop), b"STOP\n");
    }

    #[test]
    fn test_encode_telemetry_field_order() {
        let line = encode_telemetry(&sample());
        assert_eq!(line, b"42.5,1250.25,310,0.125,-6.2088,106.8456,17\n");
    }

    #[test]
    fn test_encode_telemetry_is_single_line() {
        let line = encode_telemetry(&sample());
        assert_eq!(line.iter().filter(|&&b| b == LINE_TERMINATOR).count(), 1);
        assert_eq!(*line.last().unwrap(), LINE_TERMINATOR);
    }

    #[test]
    fn test_encode_message() {
        assert_eq!(encode_message("READY"), b"#READY\n");
        assert_eq!(encode_message(HEARTBEAT_MESSAGE), b"#HB\n");
    }
}
