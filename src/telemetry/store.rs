//! Sensor telemetry store
//!
//! Merges `sensor_update` and `baseboard_status` messages into one view keyed
//! by `(baseboard, bus address)` and ages out sensors that stop reporting.
//!
//! Staleness is judged in message-timestamp terms: a sensor that keeps
//! reporting inactive samples for at least the stale timeout, counted from
//! its first inactive sample, is evicted and hidden. The sweep runs on the
//! same clock, the newest timestamp the gateway has sent, so a gateway whose
//! clock disagrees with ours ages sensors no faster than its own messages do.
//!
//! Evicted sensors that stop appearing in messages for the grace period are
//! dropped. Their keys are remembered: only an active reading brings such a
//! sensor back.

use crate::config::TelemetryConfig;
use crate::telemetry::protocol::{BaseboardStatus, SensorReading, SensorUpdate, Timestamp};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SensorKey {
    pub device_id: String,
    pub address: String,
}

impl SensorKey {
    pub fn new(device_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub key: SensorKey,
    pub name: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub raw_status: String,
    pub sensor_type: Option<String>,
    pub raw_value: Option<f64>,
    /// Timestamp of the last active sample.
    pub last_update: Option<Timestamp>,
    /// First inactive sample of the current inactive run.
    pub offline_since: Option<Timestamp>,
    pub evicted: bool,
    /// Timestamp of the last sample of any kind.
    pub last_seen: Option<Timestamp>,
}

impl SensorRecord {
    fn new(key: SensorKey) -> Self {
        Self {
            key,
            name: String::new(),
            value: None,
            unit: None,
            raw_status: String::new(),
            sensor_type: None,
            raw_value: None,
            last_update: None,
            offline_since: None,
            evicted: false,
            last_seen: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.offline_since.is_none() && !self.evicted
    }

    fn describe(&mut self, reading: &SensorReading) {
        if !reading.name.is_empty() {
            self.name = reading.name.clone();
        }
        if reading.unit.is_some() {
            self.unit = reading.unit.clone();
        }
        if reading.sensor_type.is_some() {
            self.sensor_type = reading.sensor_type.clone();
        }
        self.raw_status = reading.status.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatusRecord {
    pub device_id: String,
    pub status: String,
    pub last_seen: Timestamp,
}

/// Point-in-time copy of the visible store contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub sensors: Vec<SensorRecord>,
    pub devices: Vec<DeviceStatusRecord>,
    pub last_update: Option<Timestamp>,
}

impl TelemetrySnapshot {
    pub fn sensors_for<'a>(&'a self, device_id: &'a str) -> impl Iterator<Item = &'a SensorRecord> + 'a {
        self.sensors.iter().filter(move |r| r.key.device_id == device_id)
    }
}

#[derive(Debug)]
pub struct SensorTelemetryStore {
    stale_timeout_ms: i64,
    eviction_grace_ms: i64,
    sensors: BTreeMap<SensorKey, SensorRecord>,
    devices: BTreeMap<String, DeviceStatusRecord>,
    /// Keys of evicted sensors dropped by the sweep.
    purged: BTreeSet<SensorKey>,
    last_update: Option<Timestamp>,
    /// Newest timestamp carried by any message.
    clock: Option<Timestamp>,
}

impl Default for SensorTelemetryStore {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

impl SensorTelemetryStore {
    pub fn new(stale_timeout_ms: i64, eviction_grace_ms: i64) -> Self {
        Self {
            stale_timeout_ms,
            eviction_grace_ms,
            sensors: BTreeMap::new(),
            devices: BTreeMap::new(),
            purged: BTreeSet::new(),
            last_update: None,
            clock: None,
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(config.stale_timeout_ms, config.eviction_grace_ms)
    }

    pub fn stale_timeout_ms(&self) -> i64 {
        self.stale_timeout_ms
    }

    pub fn apply(&mut self, update: &SensorUpdate) {
        let timestamp = update.timestamp.unwrap_or_else(Timestamp::now);
        self.apply_update(&update.baseboard_id, &update.sensors, timestamp);
    }

    /// Merges one batch of readings from `device_id` stamped `timestamp`.
    pub fn apply_update(&mut self, device_id: &str, readings: &[SensorReading], timestamp: Timestamp) {
        self.advance_clock(timestamp);

        for reading in readings {
            let key = SensorKey::new(device_id, reading.i2c_address.as_str());
            let active = reading.is_active();

            if !active && self.purged.contains(&key) {
                continue;
            }
            if let Some(record) = self.sensors.get_mut(&key)
                && record.evicted
                && !active
            {
                record.last_seen = Some(timestamp);
                continue;
            }

            let record = self
                .sensors
                .entry(key.clone())
                .or_insert_with(|| SensorRecord::new(key.clone()));
            record.describe(reading);
            record.last_seen = Some(timestamp);

            if active {
                if record.evicted {
                    info!("Sensor {}@{} is back", key.address, key.device_id);
                }
                record.value = reading.value;
                record.raw_value = reading.raw_value;
                record.last_update = Some(timestamp);
                record.offline_since = None;
                record.evicted = false;
                self.purged.remove(&key);
            } else {
                let since = *record.offline_since.get_or_insert(timestamp);
                if timestamp.millis_since(since) >= self.stale_timeout_ms {
                    info!(
                        "Sensor {}@{} offline for {} ms, evicting",
                        key.address,
                        key.device_id,
                        timestamp.millis_since(since)
                    );
                    record.evicted = true;
                }
            }
        }

        self.last_update = Some(self.last_update.map_or(timestamp, |last| last.max(timestamp)));
    }

    /// Last write wins.
    pub fn apply_device_status(&mut self, device_id: &str, status: &str, timestamp: Timestamp) {
        self.advance_clock(timestamp);
        debug!("Baseboard {} is {}", device_id, status);
        self.devices.insert(
            device_id.to_string(),
            DeviceStatusRecord {
                device_id: device_id.to_string(),
                status: status.to_string(),
                last_seen: timestamp,
            },
        );
    }

    pub fn apply_status(&mut self, status: &BaseboardStatus) {
        let timestamp = status.timestamp.unwrap_or_else(Timestamp::now);
        self.apply_device_status(&status.baseboard_id, &status.status, timestamp);
    }

    /// Every visible (non-evicted) sensor in key order.
    pub fn snapshot(&self) -> Vec<SensorRecord> {
        self.sensors.values().filter(|r| !r.evicted).cloned().collect()
    }

    pub fn snapshot_for_device(&self, device_id: &str) -> Vec<SensorRecord> {
        self.sensors
            .values()
            .filter(|r| !r.evicted && r.key.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn record(&self, key: &SensorKey) -> Option<&SensorRecord> {
        self.sensors.get(key)
    }

    pub fn device_status(&self, device_id: &str) -> Option<&DeviceStatusRecord> {
        self.devices.get(device_id)
    }

    pub fn device_statuses(&self) -> Vec<DeviceStatusRecord> {
        self.devices.values().cloned().collect()
    }

    pub fn last_update(&self) -> Option<Timestamp> {
        self.last_update
    }

    pub fn full_snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            sensors: self.snapshot(),
            devices: self.device_statuses(),
            last_update: self.last_update,
        }
    }

    /// Newest message timestamp seen so far; the clock the sweep runs on.
    pub fn message_clock(&self) -> Option<Timestamp> {
        self.clock
    }

    fn advance_clock(&mut self, timestamp: Timestamp) {
        self.clock = Some(self.clock.map_or(timestamp, |clock| clock.max(timestamp)));
    }

    /// Periodic maintenance on the message clock.
    ///
    /// Evicts offline sensors whose timeout has elapsed although no sample
    /// for them arrived, and drops evicted sensors not seen for the grace
    /// period. Returns true when the visible view changed.
    pub fn sweep(&mut self) -> bool {
        let Some(now) = self.clock else {
            return false;
        };
        let mut changed = false;

        for (key, record) in self.sensors.iter_mut() {
            if record.evicted {
                continue;
            }
            if let Some(since) = record.offline_since
                && now.millis_since(since) >= self.stale_timeout_ms
            {
                debug!("Sweep evicts {}@{}", key.address, key.device_id);
                record.evicted = true;
                changed = true;
            }
        }

        let grace = self.eviction_grace_ms;
        let expired: Vec<SensorKey> = self
            .sensors
            .values()
            .filter(|r| r.evicted && r.last_seen.is_none_or(|seen| now.millis_since(seen) >= grace))
            .map(|r| r.key.clone())
            .collect();
        for key in expired {
            debug!("Dropping {}@{}", key.address, key.device_id);
            self.sensors.remove(&key);
            self.purged.insert(key);
        }

        changed
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
