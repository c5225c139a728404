//! # Device Line Protocol
//!
//! Implementation of the ASCII line protocol spoken by the ESP32 survey unit.
//!
//! This module handles:
//! - Telemetry line decoding (speed, odometer, trip, vibration, GPS, sequence)
//! - Reassembly of lines split across transport chunks
//! - Device text messages and heartbeats
//! - Host command encoding (start / pause / stop)

pub mod packet;
pub mod encoder;
pub mod decoder;
