//! # Storage Module
//!
//! [`IngestionSink`](crate::ingest::IngestionSink) implementations.
//!
//! - [`MemoryStore`]: in-process store with the project/segment query surface
//! - [`JsonlStore`]: append-only JSON Lines files for field runs

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
