//! Wire format of the telemetry stream.
//!
//! Every inbound frame is a JSON envelope `{"type": ..., "data": ...}`. The
//! gateway format is fixed; decoding here is tolerant of missing optional
//! fields and strict about the discriminant.

use crate::error::ProtocolError;
use chrono::{DateTime, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Milliseconds since the Unix epoch.
///
/// The gateway sends ISO-8601 strings (`2024-05-01T10:00:00.123456Z`); plain
/// integers are accepted as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        Self(crate::utils::now_millis())
    }

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`, never negative.
    pub fn millis_since(&self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0).max(0)
    }

    /// Parses an RFC 3339 timestamp, or a naive ISO-8601 one taken as UTC.
    pub fn parse(text: &str) -> Option<Self> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self(dt.timestamp_millis()));
        }
        let trimmed = text.trim_end_matches('Z');
        NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Self(naive.and_utc().timestamp_millis()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Timestamp(ms)),
            Raw::Float(ms) => Ok(Timestamp(ms as i64)),
            Raw::Text(text) => Timestamp::parse(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", text))),
        }
    }
}

fn default_status() -> String {
    "active".to_string()
}

/// One sensor entry of a `sensor_update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub i2c_address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(rename = "type", default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub raw_value: Option<f64>,
}

impl SensorReading {
    /// A reading counts as live only when it says so and carries a value.
    pub fn is_active(&self) -> bool {
        self.status == "active" && self.value.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub baseboard_id: String,
    #[serde(default)]
    pub sensors: Vec<SensorReading>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseboardStatus {
    pub baseboard_id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ConnectionEstablished { message: Option<String> },
    SensorUpdate(SensorUpdate),
    BaseboardStatus(BaseboardStatus),
    Pong { timestamp: Option<Timestamp> },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::ConnectionEstablished { .. } => "connection_established",
            InboundMessage::SensorUpdate(_) => "sensor_update",
            InboundMessage::BaseboardStatus(_) => "baseboard_status",
            InboundMessage::Pong { .. } => "pong",
        }
    }
}

/// Decodes one text frame from the gateway.
pub fn decode(text: &str) -> Result<InboundMessage, ProtocolError> {
    let mut envelope: Value = serde_json::from_str(text)?;
    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    match kind.as_str() {
        "connection_established" => Ok(InboundMessage::ConnectionEstablished {
            message: envelope
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }),
        "sensor_update" => payload(&mut envelope, "sensor_update").map(InboundMessage::SensorUpdate),
        "baseboard_status" => {
            payload(&mut envelope, "baseboard_status").map(InboundMessage::BaseboardStatus)
        }
        "pong" => Ok(InboundMessage::Pong {
            timestamp: envelope
                .get_mut("timestamp")
                .map(Value::take)
                .and_then(|v| serde_json::from_value(v).ok()),
        }),
        _ => Err(ProtocolError::UnknownType(kind)),
    }
}

fn payload<T: DeserializeOwned>(envelope: &mut Value, kind: &'static str) -> Result<T, ProtocolError> {
    let data = envelope.get_mut("data").map(Value::take).unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// Frames sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Ping,
}

impl OutboundMessage {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sensor_update() {
        let text = r#"{
            "type": "sensor_update",
            "data": {
                "baseboard_id": "BB-01",
                "sensors": [
                    {"i2c_address": "0x48", "name": "Temperature", "type": "temperature",
                     "raw_value": 512, "value": 21.5, "unit": "C", "status": "active",
                     "timestamp": "2024-05-01T10:00:00.250000Z"},
                    {"i2c_address": "0x49", "name": "Humidity", "value": null, "unit": "%",
                     "status": "offline"}
                ],
                "timestamp": "2024-05-01T10:00:00.250000Z"
            }
        }"#;

        let InboundMessage::SensorUpdate(update) = decode(text).unwrap() else {
            panic!("expected sensor update");
        };
        assert_eq!(update.baseboard_id, "BB-01");
        assert_eq!(update.sensors.len(), 2);
        assert!(update.sensors[0].is_active());
        assert_eq!(update.sensors[0].sensor_type.as_deref(), Some("temperature"));
        assert_eq!(update.sensors[0].raw_value, Some(512.0));
        assert!(!update.sensors[1].is_active());
        assert_eq!(update.timestamp, Some(Timestamp(1_714_557_600_250)));
    }

    #[test]
    fn test_decode_baseboard_status_without_timestamp() {
        let text = r#"{"type":"baseboard_status","data":{"baseboard_id":"BB-01","status":"offline"}}"#;
        let msg = decode(text).unwrap();
        assert_eq!(
            msg,
            InboundMessage::BaseboardStatus(BaseboardStatus {
                baseboard_id: "BB-01".into(),
                status: "offline".into(),
                timestamp: None,
            })
        );
    }

    #[test]
    fn test_decode_pong_and_ack() {
        let pong = decode(r#"{"type":"pong","timestamp":"2024-05-01T10:00:00+00:00"}"#).unwrap();
        assert_eq!(
            pong,
            InboundMessage::Pong {
                timestamp: Some(Timestamp(1_714_557_600_000))
            }
        );

        let ack = decode(r#"{"type":"connection_established","message":"hello"}"#).unwrap();
        assert_eq!(ack.kind(), "connection_established");
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        assert!(matches!(
            decode(r#"{"type":"firmware_notice","data":{}}"#),
            Err(ProtocolError::UnknownType(kind)) if kind == "firmware_notice"
        ));
        assert!(matches!(decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode(r#"{"data":{}}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"sensor_update","data":{"sensors":[]}}"#),
            Err(ProtocolError::InvalidPayload { kind: "sensor_update", .. })
        ));
    }

    #[test]
    fn test_numeric_timestamps_are_millis() {
        let text = r#"{"type":"sensor_update","data":{"baseboard_id":"A","sensors":[],"timestamp":6200}}"#;
        let InboundMessage::SensorUpdate(update) = decode(text).unwrap() else {
            panic!("expected sensor update");
        };
        assert_eq!(update.timestamp, Some(Timestamp(6200)));
    }

    #[test]
    fn test_ping_encoding() {
        assert_eq!(OutboundMessage::Ping.to_text().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_millis_since_never_negative() {
        assert_eq!(Timestamp(1000).millis_since(Timestamp(6200)), 0);
        assert_eq!(Timestamp(6200).millis_since(Timestamp(1000)), 5200);
    }
}
