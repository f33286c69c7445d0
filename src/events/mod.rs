//! Event fan-out
//!
//! A small topic-keyed publish/subscribe layer so several independent
//! consumers can observe one telemetry connection without knowing anything
//! about the transport underneath.

mod bus;
mod topics;

pub use bus::{EventBus, Subscription};
pub use topics::{ConnectionStatus, Event, Topic};
