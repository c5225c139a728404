//! # Packet Decoder
//!
//! Turns the raw byte stream from the link into [`DecodedFrame`]s.
//!
//! The transport hands over chunks of arbitrary size. Bytes after the last
//! terminator stay buffered until the rest of the line arrives. Corrupt
//! lines are dropped and counted so one bad reading never stalls the
//! stream, and a buffer that grows past the line bound without a
//! terminator is discarded.

use bytes::BytesMut;
use tracing::{debug, warn};

use super::packet::*;
use crate::error::{Result, RoadsenseError};

/// Decode one telemetry line (without terminator)
///
/// # Errors
///
/// Returns `Protocol` if the line does not have exactly
/// [`TELEMETRY_FIELD_COUNT`] fields or any field is not a finite number.
///
/// # Examples
///
/// ```
/// use roadsense_logger::protocol::decoder::decode_telemetry_line;
///
/// let sample = decode_telemetry_line("30.5,1200,45,0.02,-6.2,106.8,9").unwrap();
/// assert_eq!(sample.sequence, 9);
/// assert_eq!(sample.odometer_m, 1200.0);
/// ```
pub fn decode_telemetry_line(line: &str) -> Result<RawTelemetry> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).map(str::trim).collect();

    if fields.len() != TELEMETRY_FIELD_COUNT {
        return Err(RoadsenseError::Protocol(format!(
            "expected {} fields, got {}",
            TELEMETRY_FIELD_COUNT,
            fields.len()
        )));
    }

    let sequence = fields[6]
        .parse::<u32>()
        .map_err(|e| RoadsenseError::Protocol(format!("sequence {:?}: {}", fields[6], e)))?;

    Ok(RawTelemetry {
        speed_kmh: parse_finite(fields[0], "speed")? as f32,
        odometer_m: parse_finite(fields[1], "odometer")?,
        trip_distance_m: parse_finite(fields[2], "trip")?,
        vibration_z: parse_finite(fields[3], "vibration")? as f32,
        latitude: parse_finite(fields[4], "latitude")?,
        longitude: parse_finite(fields[5], "longitude")?,
        sequence,
    })
}

fn parse_finite(field: &str, name: &str) -> Result<f64> {
    let value = field
        .parse::<f64>()
        .map_err(|e| RoadsenseError::Protocol(format!("{} {:?}: {}", name, field, e)))?;

    if !value.is_finite() {
        return Err(RoadsenseError::Protocol(format!(
            "{} is not finite: {:?}",
            name, field
        )));
    }

    Ok(value)
}

/// Stateful framer and parser for one link session
#[derive(Debug)]
pub struct PacketDecoder {
    buffer: BytesMut,
    max_line_length: usize,
    last_sequence: Option<u32>,
    stats: DecoderStats,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl PacketDecoder {
    /// Create a decoder that discards more than `max_line_length`
    /// unterminated bytes
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line_length),
            max_line_length,
            last_sequence: None,
            stats: DecoderStats::default(),
        }
    }

    /// Append a chunk received from the transport
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, if one is buffered
    ///
    /// Dropped and blank lines are skipped. Returns `None` once only an
    /// incomplete line (or nothing) remains.
    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == LINE_TERMINATOR) else {
                if self.buffer.len() > self.max_line_length {
                    let discarded = self.buffer.len();
                    self.buffer.clear();
                    self.stats.overflows += 1;
                    warn!(
                        "Discarded {} bytes without line terminator (limit {})",
                        discarded, self.max_line_length
                    );
                    return Some(DecodedFrame::Overflow { discarded });
                }
                return None;
            };

            let line = self.buffer.split_to(pos + 1);
            if let Some(frame) = self.decode_line(&line[..pos]) {
                return Some(frame);
            }
        }
    }

    /// Push a chunk and drain every frame it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        self.push(chunk);
        self.frames().collect()
    }

    /// Lazily drain buffered frames
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }

    /// Forget buffered bytes and sequence tracking for a new connection
    ///
    /// Counters are kept for the lifetime of the decoder.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_sequence = None;
    }

    /// Current counters
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Number of bytes waiting for a terminator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<DecodedFrame> {
        let Ok(text) = std::str::from_utf8(raw) else {
            self.stats.lines_dropped += 1;
            debug!("Dropped non UTF-8 line ({} bytes)", raw.len());
            return None;
        };

        let line = text.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(body) = line.strip_prefix(MESSAGE_PREFIX) {
            let body = body.trim();
            if body == HEARTBEAT_MESSAGE {
                return Some(DecodedFrame::Heartbeat);
            }
            return Some(DecodedFrame::Message(body.to_string()));
        }

        match decode_telemetry_line(line) {
            Ok(sample) => {
                self.track_sequence(sample.sequence);
                self.stats.frames_decoded += 1;
                Some(DecodedFrame::Telemetry(sample))
            }
            Err(e) => {
                self.stats.lines_dropped += 1;
                debug!("Dropped telemetry line {:?}: {}", line, e);
                None
            }
        }
    }

    fn track_sequence(&mut self, sequence: u32) {
        if let Some(last) = self.last_sequence {
            if sequence == last {
                self.stats.duplicates += 1;
            } else if sequence > last {
                self.stats.lost_packets += u64::from(sequence - last - 1);
            } else {
                self.stats.sequence_resets += 1;
            }
        }
        self.last_sequence = Some(sequence);
    }
}

/// Iterator returned by [`PacketDecoder::frames`]
pub struct Frames<'a> {
    decoder: &'a mut PacketDecoder,
}

impl Iterator for Frames<'_> {
    type Item = DecodedFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}
