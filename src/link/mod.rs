//! # Link Module
//!
//! Owns the device connection lifecycle.
//!
//! A single worker task holds the transport, the decoder and the aggregator.
//! [`LinkManager`] is a cheap handle that queues commands onto that task and
//! reads the state and telemetry it publishes.

pub mod bus;
pub mod event;
pub mod manager;
pub mod state;

pub use bus::{EventBus, EventStream, StreamEnd};
pub use event::{ErrorKind, LinkEvent};
pub use manager::{LinkManager, ManagerConfig};
pub use state::LinkState;
