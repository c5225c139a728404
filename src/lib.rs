//! # Roadsense Logger Library
//!
//! Log road-survey telemetry streamed from an ESP32 sensor unit.
//!
//! This library provides the link and ingestion pipeline: it owns the
//! serial-profile connection to the unit, decodes its line protocol,
//! derives station, chainage and trip distance for the open road segment,
//! and hands survey rows to a storage sink in batches.

pub mod config;
pub mod error;
pub mod ingest;
pub mod link;
pub mod model;
pub mod protocol;
pub mod station;
pub mod storage;
pub mod transport;
