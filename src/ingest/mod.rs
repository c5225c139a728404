//! # Ingestion Module
//!
//! Turns decoded telemetry into stored survey rows.
//!
//! This module handles:
//! - Enriching raw samples with station and chainage for the open segment
//! - Tracking the trip accumulator and the segment's furthest chainage
//! - Batching rows and persisting them off the read path
//! - The storage boundary the pipeline writes into

pub mod aggregator;
pub mod sink;
pub mod writer;

pub use aggregator::{TelemetryAggregator, TelemetrySnapshot};
pub use sink::IngestionSink;
pub use writer::{IngestWriter, WriterConfig};
