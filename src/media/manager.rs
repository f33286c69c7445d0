//! Media session manager
//!
//! Owns the three media sessions of one edge device (video feed, audio
//! feed, push-to-talk) and the reachability probe loop. Every session runs
//! on its own task under a child of the manager's stop signal, so stopping a
//! session, shutting the manager down or dropping it releases all resources.

use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::media::endpoints::MediaEndpoints;
use crate::media::host::{CaptureDevice, MediaHost, PlaybackSink, SinkKind};
use crate::media::mjpeg::MjpegSplitter;
use crate::media::probe::ReachabilityProbe;
use crate::media::session::{SessionKind, SessionState};
use crate::media::transport::{ChunkSink, MediaTransport};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Slot {
    state: SessionState,
    /// Bumped by every start and stop; late task results for an older
    /// generation are discarded.
    generation: u64,
    sos: Option<SignalOfStop>,
}

#[derive(Default)]
struct Sessions {
    video: Slot,
    audio: Slot,
    push: Slot,
    last_error: Option<MediaError>,
}

impl Sessions {
    fn slot(&mut self, kind: SessionKind) -> &mut Slot {
        match kind {
            SessionKind::VideoFeed => &mut self.video,
            SessionKind::AudioFeed => &mut self.audio,
            SessionKind::PushToTalk => &mut self.push,
        }
    }
}

/// Resources of a running push-to-talk session.
struct PushSession {
    device: Box<dyn CaptureDevice>,
    sink: ChunkSink,
    chunks: mpsc::Receiver<Bytes>,
}

impl PushSession {
    /// Stops capture first, then closes the channel.
    async fn release(self, host: &dyn MediaHost) {
        let PushSession { device, mut sink, chunks } = self;
        drop(chunks);
        host.release_capture(device);
        if let Err(e) = sink.close().await {
            debug!("Push-to-talk channel close: {}", e);
        }
    }
}

struct Inner {
    config: MediaConfig,
    endpoints: MediaEndpoints,
    host: Arc<dyn MediaHost>,
    transport: Arc<dyn MediaTransport>,
    sessions: Mutex<Sessions>,
    reachable: watch::Sender<Option<bool>>,
    probe: Mutex<Option<SignalOfStop>>,
    root: SignalOfStop,
}

pub struct MediaSessionManager {
    inner: Arc<Inner>,
}

impl MediaSessionManager {
    pub fn new(config: MediaConfig, host: Arc<dyn MediaHost>, transport: Arc<dyn MediaTransport>) -> Self {
        let (reachable, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                endpoints: MediaEndpoints::new(&config.base_url),
                config,
                host,
                transport,
                sessions: Mutex::new(Sessions::default()),
                reachable,
                probe: Mutex::new(None),
                root: SignalOfStop::new(),
            }),
        }
    }

    pub fn endpoints(&self) -> &MediaEndpoints {
        &self.inner.endpoints
    }

    pub fn state(&self, kind: SessionKind) -> SessionState {
        lock(&self.inner.sessions).slot(kind).state
    }

    /// The most recent session failure, if any.
    pub fn last_error(&self) -> Option<MediaError> {
        lock(&self.inner.sessions).last_error.clone()
    }

    /// Result of the latest health probe; `None` before the first one.
    pub fn is_reachable(&self) -> Option<bool> {
        *self.inner.reachable.borrow()
    }

    pub fn watch_reachability(&self) -> watch::Receiver<Option<bool>> {
        self.inner.reachable.subscribe()
    }

    /// Marks the video feed active and starts pulling frames in the
    /// background. Pull failures surface later as [`SessionState::Error`].
    pub fn start_video_feed(&self) -> Result<(), MediaError> {
        self.inner.start_feed(SessionKind::VideoFeed)
    }

    pub fn stop_video_feed(&self) {
        self.inner.stop(SessionKind::VideoFeed);
    }

    /// Fails fast with [`MediaError::Unreachable`] when the last probe failed.
    pub fn start_audio_feed(&self) -> Result<(), MediaError> {
        self.inner.start_feed(SessionKind::AudioFeed)
    }

    pub fn stop_audio_feed(&self) {
        self.inner.stop(SessionKind::AudioFeed);
    }

    /// Acquires capture, opens the outbound channel and starts streaming.
    ///
    /// Returns false on any failure, with everything acquired so far
    /// released; [`last_error`](Self::last_error) then says why. A
    /// concurrent [`stop_push_to_talk`](Self::stop_push_to_talk) aborts the
    /// start the same way.
    ///
    /// Only one push-to-talk session exists at a time: while one is starting
    /// or streaming this returns false with [`MediaError::AlreadyActive`]
    /// and leaves the running session alone.
    pub async fn start_push_to_talk(&self) -> bool {
        let inner = &self.inner;
        let Some((generation, sos)) = inner.begin(SessionKind::PushToTalk, SessionState::Starting) else {
            debug!("Push-to-talk already {:?}", self.state(SessionKind::PushToTalk));
            lock(&inner.sessions).last_error = Some(MediaError::AlreadyActive);
            return false;
        };

        match inner.open_push_session(&sos).await {
            Ok(session) => {
                if !inner.set_state(SessionKind::PushToTalk, generation, SessionState::Active) {
                    session.release(inner.host.as_ref()).await;
                    inner.fail_start(generation, MediaError::Cancelled);
                    return false;
                }
                info!("Push-to-talk streaming to {}", inner.endpoints.push_to_talk());
                let task = Arc::clone(inner);
                tokio::spawn(async move { task.stream_push(generation, sos, session).await });
                true
            }
            Err(e) => {
                warn!("Push-to-talk failed to start: {}", e);
                inner.fail_start(generation, e);
                false
            }
        }
    }

    /// Stops capture and closes the channel. No-op when idle.
    pub fn stop_push_to_talk(&self) {
        self.inner.stop(SessionKind::PushToTalk);
    }

    /// (Re)starts the health probe loop; the first probe runs immediately.
    pub fn start_probing(&self) {
        let mut slot = lock(&self.inner.probe);
        if let Some(previous) = slot.take() {
            previous.cancel();
        }

        let sos = self.inner.root.child();
        let inner = Arc::clone(&self.inner);
        sos.spawn(async move { inner.probe_loop().await });
        *slot = Some(sos);
    }

    pub fn stop_probing(&self) {
        if let Some(sos) = lock(&self.inner.probe).take() {
            sos.cancel();
        }
    }

    /// Stops every session and the probe loop.
    pub fn shutdown(&self) {
        for kind in SessionKind::ALL {
            self.inner.stop(kind);
        }
        self.stop_probing();
    }
}

impl Drop for MediaSessionManager {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

impl Inner {
    /// Claims the slot for a new run unless one is already running.
    fn begin(&self, kind: SessionKind, state: SessionState) -> Option<(u64, SignalOfStop)> {
        let mut sessions = lock(&self.sessions);
        let slot = sessions.slot(kind);
        if slot.state.is_running() {
            return None;
        }
        slot.generation += 1;
        slot.state = state;
        let sos = self.root.child();
        slot.sos = Some(sos.clone());
        Some((slot.generation, sos))
    }

    fn set_state(&self, kind: SessionKind, generation: u64, state: SessionState) -> bool {
        let mut sessions = lock(&self.sessions);
        let slot = sessions.slot(kind);
        if slot.generation != generation {
            return false;
        }
        slot.state = state;
        true
    }

    fn stop(&self, kind: SessionKind) {
        let mut sessions = lock(&self.sessions);
        let slot = sessions.slot(kind);
        slot.generation += 1;
        if let Some(sos) = slot.sos.take() {
            sos.cancel();
        }
        if slot.state != SessionState::Idle {
            info!("{} stopped", kind);
        }
        slot.state = SessionState::Idle;
    }

    /// Final outcome of a session task.
    fn settle(&self, kind: SessionKind, generation: u64, result: Result<(), MediaError>) {
        let mut sessions = lock(&self.sessions);
        let slot = sessions.slot(kind);
        if slot.generation != generation {
            return;
        }
        slot.sos = None;
        match result {
            Ok(()) => slot.state = SessionState::Idle,
            Err(e) => {
                warn!("{} failed: {}", kind, e);
                slot.state = SessionState::Error;
                sessions.last_error = Some(e);
            }
        }
    }

    fn fail_start(&self, generation: u64, error: MediaError) {
        let mut sessions = lock(&self.sessions);
        let slot = sessions.slot(SessionKind::PushToTalk);
        if slot.generation == generation {
            slot.sos = None;
            slot.state = SessionState::Error;
        }
        sessions.last_error = Some(error);
    }

    fn start_feed(self: &Arc<Self>, kind: SessionKind) -> Result<(), MediaError> {
        if kind == SessionKind::AudioFeed && *self.reachable.borrow() == Some(false) {
            lock(&self.sessions).last_error = Some(MediaError::Unreachable);
            return Err(MediaError::Unreachable);
        }

        let Some((generation, sos)) = self.begin(kind, SessionState::Active) else {
            debug!("{} already running", kind);
            return Ok(());
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match inner.run_feed(kind, &sos).await {
                Some(result) => inner.settle(kind, generation, result),
                None => debug!("{} task finished after stop", kind),
            }
        });
        Ok(())
    }

    /// Returns `None` when stopped.
    async fn run_feed(&self, kind: SessionKind, sos: &SignalOfStop) -> Option<Result<(), MediaError>> {
        let sink_kind = match kind {
            SessionKind::VideoFeed => SinkKind::Video,
            _ => SinkKind::Audio,
        };
        let mut sink = match sos.select(self.host.open_playback_sink(sink_kind)).await? {
            Ok(sink) => sink,
            Err(e) => return Some(Err(e)),
        };

        let outcome = sos.select(self.pump_feed(kind, sink.as_mut())).await;
        if let Err(e) = sink.close().await {
            warn!("Closing {} sink: {}", kind, e);
        }
        outcome
    }

    async fn pump_feed(&self, kind: SessionKind, sink: &mut dyn PlaybackSink) -> Result<(), MediaError> {
        let url = match kind {
            SessionKind::VideoFeed => self.endpoints.video(),
            _ => self.endpoints.audio(),
        };
        let mut stream = self.transport.open_pull(&url).await?;
        info!("{} started from {}", kind, url);

        let mut splitter = (kind == SessionKind::VideoFeed).then(MjpegSplitter::new);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            match splitter.as_mut() {
                Some(splitter) => {
                    for frame in splitter.push(&chunk) {
                        sink.write(frame).await?;
                    }
                }
                None => sink.write(chunk).await?,
            }
        }

        Err(MediaError::Transport(format!("{} ended", url)))
    }

    async fn open_push_session(&self, sos: &SignalOfStop) -> Result<PushSession, MediaError> {
        let mut device = sos
            .select(self.host.acquire_capture())
            .await
            .ok_or(MediaError::Cancelled)??;

        let timeout = self.config.push_open_timeout();
        let url = self.endpoints.push_to_talk();
        let opened = sos
            .select(tokio::time::timeout(timeout, self.transport.open_push(&url)))
            .await;

        let failure = match opened {
            Some(Ok(Ok(mut sink))) => {
                let started = sos.select(device.start(self.config.push_chunk())).await;
                match started {
                    Some(Ok(chunks)) => return Ok(PushSession { device, sink, chunks }),
                    Some(Err(e)) => {
                        let _ = sink.close().await;
                        e
                    }
                    None => {
                        let _ = sink.close().await;
                        MediaError::Cancelled
                    }
                }
            }
            Some(Ok(Err(e))) => e,
            Some(Err(_)) => MediaError::ChannelTimeout(timeout),
            None => MediaError::Cancelled,
        };

        self.host.release_capture(device);
        Err(failure)
    }

    async fn stream_push(self: Arc<Self>, generation: u64, sos: SignalOfStop, mut session: PushSession) {
        let outcome = loop {
            tokio::select! {
                _ = sos.wait_cancellation() => break None,
                chunk = session.chunks.recv() => match chunk {
                    Some(chunk) => {
                        if let Err(e) = session.sink.send(chunk).await {
                            break Some(Err(e));
                        }
                    }
                    None => break Some(Ok(())),
                },
            }
        };

        session.release(self.host.as_ref()).await;
        match outcome {
            Some(result) => {
                if result.is_ok() {
                    info!("Push-to-talk capture ended");
                }
                self.settle(SessionKind::PushToTalk, generation, result);
            }
            None => debug!("Push-to-talk resources released"),
        }
    }

    async fn probe_loop(&self) {
        let url = self.endpoints.health();
        let timeout = self.config.probe_timeout();
        let mut probe = ReachabilityProbe::new(&self.config);

        loop {
            let ok = tokio::time::timeout(timeout, self.transport.probe(&url, timeout))
                .await
                .unwrap_or(false);
            let wait = probe.record(ok);

            let changed = self.reachable.send_if_modified(|current| current.replace(ok) != Some(ok));
            if changed {
                if ok {
                    info!("{} is reachable", self.endpoints.base());
                } else {
                    warn!("{} is unreachable", self.endpoints.base());
                }
            }

            debug!(
                "Next probe in {:?} ({} consecutive failures)",
                wait,
                probe.consecutive_failures()
            );
            tokio::time::sleep(wait).await;
        }
    }
}
