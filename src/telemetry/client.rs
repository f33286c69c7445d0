use crate::config::TelemetryConfig;
use crate::events::{Event, EventBus, Subscription, Topic};
use crate::telemetry::connection::{ConnectionOptions, ConnectionState, StreamConnection};
use crate::telemetry::store::{DeviceStatusRecord, SensorRecord, SensorTelemetryStore, TelemetrySnapshot};
use crate::telemetry::transport::{Connector, WsConnector};
use crate::utils::sos::SignalOfStop;
use log::debug;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;

type SharedStore = Arc<RwLock<SensorTelemetryStore>>;

fn read(store: &SharedStore) -> RwLockReadGuard<'_, SensorTelemetryStore> {
    store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(store: &SharedStore) -> RwLockWriteGuard<'_, SensorTelemetryStore> {
    store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A telemetry connection wired into its own sensor store.
///
/// Every accepted update refreshes a [`TelemetrySnapshot`] published on a
/// watch channel, so consumers can either poll [`snapshot`](Self::snapshot)
/// or await changes.
pub struct TelemetryClient {
    connection: StreamConnection,
    store: SharedStore,
    snapshot: Arc<watch::Sender<TelemetrySnapshot>>,
    sweep_interval: Option<Duration>,
    sweeper: Mutex<Option<SignalOfStop>>,
    _subscriptions: Vec<Subscription>,
}

impl TelemetryClient {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: &TelemetryConfig, connector: Arc<dyn Connector>) -> Self {
        let bus = EventBus::new();
        let connection = StreamConnection::with_connector(ConnectionOptions::from_config(config), connector, bus);
        let store: SharedStore = Arc::new(RwLock::new(SensorTelemetryStore::from_config(config)));
        let (snapshot, _) = watch::channel(TelemetrySnapshot::default());
        let snapshot = Arc::new(snapshot);

        let on_update = {
            let store = Arc::clone(&store);
            let snapshot = Arc::clone(&snapshot);
            connection.subscribe(Topic::SensorUpdate, move |event| {
                if let Event::SensorUpdate(update) = event {
                    let mut guard = write(&store);
                    guard.apply(update);
                    snapshot.send_replace(guard.full_snapshot());
                }
            })
        };

        let on_status = {
            let store = Arc::clone(&store);
            let snapshot = Arc::clone(&snapshot);
            connection.subscribe(Topic::BaseboardStatus, move |event| {
                if let Event::BaseboardStatus(status) = event {
                    let mut guard = write(&store);
                    guard.apply_status(status);
                    snapshot.send_replace(guard.full_snapshot());
                }
            })
        };

        Self {
            connection,
            store,
            snapshot,
            sweep_interval: config.sweep_interval(),
            sweeper: Mutex::new(None),
            _subscriptions: vec![on_update, on_status],
        }
    }

    pub fn connection(&self) -> &StreamConnection {
        &self.connection
    }

    pub fn connect(&self) {
        self.start_sweeper();
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn subscribe<F>(&self, topic: Topic, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.connection.subscribe(topic, listener)
    }

    pub fn ping(&self) {
        self.connection.ping();
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        read(&self.store).full_snapshot()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshot.subscribe()
    }

    pub fn sensors(&self) -> Vec<SensorRecord> {
        read(&self.store).snapshot()
    }

    pub fn sensors_for(&self, device_id: &str) -> Vec<SensorRecord> {
        read(&self.store).snapshot_for_device(device_id)
    }

    pub fn device_status(&self, device_id: &str) -> Option<DeviceStatusRecord> {
        read(&self.store).device_status(device_id).cloned()
    }

    fn start_sweeper(&self) {
        let Some(period) = self.sweep_interval else {
            return;
        };
        let mut slot = self.sweeper.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let sos = SignalOfStop::new();
        let store = Arc::clone(&self.store);
        let snapshot = Arc::clone(&self.snapshot);
        sos.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let mut guard = write(&store);
                if guard.sweep() {
                    debug!("Sweep changed the visible sensors");
                    snapshot.send_replace(guard.full_snapshot());
                }
            }
        });
        *slot = Some(sos);
    }
}

impl Drop for TelemetryClient {
    fn drop(&mut self) {
        if let Some(sos) = self.sweeper.get_mut().ok().and_then(Option::take) {
            sos.cancel();
        }
    }
}
