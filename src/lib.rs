//! Client side of the XIOT sensor gateway: a self-healing telemetry stream
//! with a staleness-aware sensor store, media sessions against the edge
//! multimedia server, and LCD display commands.

pub mod config;
pub mod display;
pub mod error;
pub mod events;
pub mod media;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ClientConfig;
pub use display::{DisplayCommand, DisplayCommandDispatcher};
pub use error::{CommandError, MediaError, ProtocolError, TransportError};
pub use events::{ConnectionStatus, Event, EventBus, Subscription, Topic};
pub use media::{MediaSessionManager, SessionKind, SessionState};
pub use telemetry::{ConnectionState, SensorTelemetryStore, StreamConnection, TelemetryClient};
