use crate::telemetry::protocol::{BaseboardStatus, SensorUpdate, Timestamp};
use std::fmt;

/// Named channels of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    SensorUpdate,
    BaseboardStatus,
    Pong,
    Error,
}

impl Topic {
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Connection => "connection",
            Topic::SensorUpdate => "sensor_update",
            Topic::BaseboardStatus => "baseboard_status",
            Topic::Pong => "pong",
            Topic::Error => "error",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of the `connection` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// Automatic reconnection gave up.
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Everything that travels over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connection(ConnectionStatus),
    SensorUpdate(SensorUpdate),
    BaseboardStatus(BaseboardStatus),
    Pong { timestamp: Option<Timestamp> },
    /// Transport-level error, informational only.
    Error(String),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Connection(_) => Topic::Connection,
            Event::SensorUpdate(_) => Topic::SensorUpdate,
            Event::BaseboardStatus(_) => Topic::BaseboardStatus,
            Event::Pong { .. } => Topic::Pong,
            Event::Error(_) => Topic::Error,
        }
    }
}
