//! In-crate fakes for the transport and host seams.

use crate::error::{MediaError, TransportError};
use crate::media::{ByteStream, CaptureDevice, ChunkSink, MediaHost, MediaTransport, PlaybackSink, SinkKind};
use crate::telemetry::transport::{Channel, Connector};
use crate::utils::sos::SignalOfStop;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::PollSender;

/// Gateway end of one accepted fake connection. Dropping it closes the
/// stream seen by the client.
pub(crate) struct ServerSide {
    pub inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    pub outbound: mpsc::Receiver<String>,
}

impl ServerSide {
    pub fn push(&self, text: &str) {
        let _ = self.inbound.send(Ok(text.to_string()));
    }
}

pub(crate) struct FakeConnector {
    accepting: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
    sessions: mpsc::UnboundedSender<ServerSide>,
}

impl FakeConnector {
    fn build(accepting: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepting: AtomicBool::new(accepting),
            attempts: Mutex::new(Vec::new()),
            sessions,
        });
        (connector, rx)
    }

    pub fn accepting() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::build(true)
    }

    pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        Self::build(false)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Instants of every connect call so far.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &str) -> Result<Channel, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<String, TransportError>>();
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        let _ = self.sessions.send(ServerSide {
            inbound: in_tx,
            outbound: out_rx,
        });

        let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let sink = PollSender::new(out_tx).sink_map_err(|_| TransportError::Closed);

        Ok(Channel {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

/// Decrements the open-channel count when the fake push channel is dropped.
struct ChannelGuard(Arc<AtomicI64>);

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeHost {
    hang_acquire: AtomicBool,
    fail_acquire: AtomicBool,
    active: AtomicI64,
    closed_sinks: Arc<AtomicI64>,
    written: Arc<Mutex<Vec<(SinkKind, Bytes)>>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hang_acquire: AtomicBool::new(false),
            fail_acquire: AtomicBool::new(false),
            active: AtomicI64::new(0),
            closed_sinks: Arc::new(AtomicI64::new(0)),
            written: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn set_hang_acquire(&self, hang: bool) {
        self.hang_acquire.store(hang, Ordering::SeqCst);
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Acquired minus released capture devices.
    pub fn active_captures(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn closed_sinks(&self) -> i64 {
        self.closed_sinks.load(Ordering::SeqCst)
    }

    pub fn written(&self, kind: SinkKind) -> Vec<Bytes> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }
}

struct FakeCapture {
    sos: SignalOfStop,
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn start(&mut self, slice: Duration) -> Result<mpsc::Receiver<Bytes>, MediaError> {
        let (tx, rx) = mpsc::channel(16);
        self.sos.spawn(async move {
            let mut n = 0u8;
            loop {
                tokio::time::sleep(slice).await;
                n = n.wrapping_add(1);
                if tx.send(Bytes::from(vec![n; 4])).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn stop(&mut self) {
        self.sos.cancel();
    }
}

struct RecordingSink {
    kind: SinkKind,
    written: Arc<Mutex<Vec<(SinkKind, Bytes)>>>,
    closed: Arc<AtomicI64>,
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), MediaError> {
        self.written.lock().unwrap().push((self.kind, chunk));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MediaHost for FakeHost {
    async fn acquire_capture(&self) -> Result<Box<dyn CaptureDevice>, MediaError> {
        if self.hang_acquire.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(MediaError::Acquisition("permission denied".into()));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            sos: SignalOfStop::new(),
        }))
    }

    fn release_capture(&self, mut device: Box<dyn CaptureDevice>) {
        device.stop();
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn open_playback_sink(&self, kind: SinkKind) -> Result<Box<dyn PlaybackSink>, MediaError> {
        Ok(Box::new(RecordingSink {
            kind,
            written: Arc::clone(&self.written),
            closed: Arc::clone(&self.closed_sinks),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushMode {
    Accept,
    Hang,
    Refuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Up,
    Down,
    Hang,
}

pub(crate) struct FakeTransport {
    push_mode: Mutex<PushMode>,
    push_attempts: AtomicU32,
    open_channels: Arc<AtomicI64>,
    pushed: Arc<Mutex<Vec<Bytes>>>,
    probes: Mutex<VecDeque<ProbeOutcome>>,
    default_probe: Mutex<ProbeOutcome>,
    probe_times: Mutex<Vec<Instant>>,
    pulls: Mutex<HashMap<String, Vec<Bytes>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            push_mode: Mutex::new(PushMode::Accept),
            push_attempts: AtomicU32::new(0),
            open_channels: Arc::new(AtomicI64::new(0)),
            pushed: Arc::new(Mutex::new(Vec::new())),
            probes: Mutex::new(VecDeque::new()),
            default_probe: Mutex::new(ProbeOutcome::Up),
            probe_times: Mutex::new(Vec::new()),
            pulls: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_push_mode(&self, mode: PushMode) {
        *self.push_mode.lock().unwrap() = mode;
    }

    /// Outcomes for the next probes, before falling back to the default.
    pub fn script_probes(&self, outcomes: impl IntoIterator<Item = ProbeOutcome>) {
        self.probes.lock().unwrap().extend(outcomes);
    }

    pub fn set_default_probe(&self, outcome: ProbeOutcome) {
        *self.default_probe.lock().unwrap() = outcome;
    }

    /// Body served for pulls of `url`; the stream stays open afterwards.
    pub fn serve(&self, url: &str, chunks: Vec<Bytes>) {
        self.pulls.lock().unwrap().insert(url.to_string(), chunks);
    }

    pub fn push_attempts(&self) -> u32 {
        self.push_attempts.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> i64 {
        self.open_channels.load(Ordering::SeqCst)
    }

    pub fn pushed(&self) -> Vec<Bytes> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn probe_times(&self) -> Vec<Instant> {
        self.probe_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn probe(&self, _url: &str, _timeout: Duration) -> bool {
        self.probe_times.lock().unwrap().push(Instant::now());
        let outcome = {
            let scripted = self.probes.lock().unwrap().pop_front();
            scripted.unwrap_or(*self.default_probe.lock().unwrap())
        };
        match outcome {
            ProbeOutcome::Up => true,
            ProbeOutcome::Down => false,
            ProbeOutcome::Hang => std::future::pending::<bool>().await,
        }
    }

    async fn open_pull(&self, url: &str) -> Result<ByteStream, MediaError> {
        let Some(chunks) = self.pulls.lock().unwrap().get(url).cloned() else {
            return Err(MediaError::Transport(format!("{} returned 404", url)));
        };
        Ok(futures_util::stream::iter(chunks.into_iter().map(Ok))
            .chain(futures_util::stream::pending())
            .boxed())
    }

    async fn open_push(&self, _url: &str) -> Result<ChunkSink, MediaError> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.push_mode.lock().unwrap();
        match mode {
            PushMode::Refuse => Err(MediaError::Channel("handshake rejected".into())),
            PushMode::Hang => std::future::pending().await,
            PushMode::Accept => {
                self.open_channels.fetch_add(1, Ordering::SeqCst);
                let guard = ChannelGuard(Arc::clone(&self.open_channels));
                let sink = futures_util::sink::unfold(
                    (guard, Arc::clone(&self.pushed)),
                    |(guard, pushed), chunk: Bytes| async move {
                        pushed.lock().unwrap().push(chunk);
                        Ok::<_, MediaError>((guard, pushed))
                    },
                );
                Ok(Box::pin(sink))
            }
        }
    }
}
