//! Real-time sensor telemetry: the self-healing gateway stream, its wire
//! format and the store that turns the stream into a current view.

mod client;
mod connection;
mod policy;
pub mod protocol;
mod store;
pub mod transport;

pub use client::TelemetryClient;
pub use connection::{ConnectionOptions, ConnectionState, StreamConnection};
pub use policy::ReconnectPolicy;
pub use store::{DeviceStatusRecord, SensorKey, SensorRecord, SensorTelemetryStore, TelemetrySnapshot};
