//! Host capabilities used by media sessions: audio capture and playback.
//!
//! Session logic only talks to [`MediaHost`]; the desktop implementation
//! writes received media to disk and captures either from the default input
//! device (`native-audio` feature) or from a pre-encoded WebM/Opus file.
//!
//! Push-to-talk chunks are always pieces of one WebM/Opus stream; the device
//! pipes them straight into its player.

use crate::error::MediaError;
use crate::utils::sos::SignalOfStop;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Replay rate for WebM files: 64 kbit/s, at or above what voice
/// recordings are encoded at, so the device never starves.
pub const FILE_REPLAY_BYTES_PER_SECOND: u64 = 8_000;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Bytes of a replayed file sent per `slice`.
pub fn bytes_per_slice(slice: Duration) -> usize {
    ((FILE_REPLAY_BYTES_PER_SECOND as u128 * slice.as_millis()) / 1000).max(1) as usize
}

/// True when `head` starts with the EBML header every WebM file opens with.
pub fn is_webm(head: &[u8]) -> bool {
    head.starts_with(&EBML_MAGIC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    /// One complete JPEG frame per write.
    Video,
    /// Continuous encoded audio bytes.
    Audio,
}

#[async_trait]
pub trait CaptureDevice: Send {
    /// Starts capturing; every `slice` one chunk is delivered on the
    /// returned channel. The channel closes when capture ends.
    async fn start(&mut self, slice: Duration) -> Result<mpsc::Receiver<Bytes>, MediaError>;

    fn stop(&mut self);
}

#[async_trait]
pub trait PlaybackSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<(), MediaError>;

    async fn close(&mut self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait MediaHost: Send + Sync + 'static {
    async fn acquire_capture(&self) -> Result<Box<dyn CaptureDevice>, MediaError>;

    fn release_capture(&self, device: Box<dyn CaptureDevice>);

    async fn open_playback_sink(&self, kind: SinkKind) -> Result<Box<dyn PlaybackSink>, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Microphone,
    /// A WebM/Opus recording, streamed at replay pace.
    File(PathBuf),
}

/// Filesystem-backed host.
///
/// Video frames replace `<dir>/video/latest.jpg`; audio is appended to
/// `<dir>/audio.mp3`. Only one capture device can be held at a time.
pub struct DesktopHost {
    output_dir: PathBuf,
    source: CaptureSource,
    capture_held: Arc<AtomicBool>,
}

impl DesktopHost {
    pub fn new(output_dir: impl Into<PathBuf>, source: CaptureSource) -> Self {
        Self {
            output_dir: output_dir.into(),
            source,
            capture_held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn open_device(&self) -> Result<Box<dyn CaptureDevice>, MediaError> {
        match &self.source {
            CaptureSource::File(path) => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| MediaError::Acquisition(format!("{}: {}", path.display(), e)))?;
                let mut head = [0u8; 4];
                if file.read_exact(&mut head).await.is_err() || !is_webm(&head) {
                    return Err(MediaError::Acquisition(format!("{} is not a WebM file", path.display())));
                }
                Ok(Box::new(FileCapture::new(path.clone())))
            }
            #[cfg(feature = "native-audio")]
            CaptureSource::Microphone => Ok(Box::new(crate::media::capture::MicrophoneCapture::new())),
            #[cfg(not(feature = "native-audio"))]
            CaptureSource::Microphone => Err(MediaError::Acquisition(
                "microphone capture needs the native-audio feature".to_string(),
            )),
        }
    }
}

#[async_trait]
impl MediaHost for DesktopHost {
    async fn acquire_capture(&self) -> Result<Box<dyn CaptureDevice>, MediaError> {
        if self.capture_held.swap(true, Ordering::SeqCst) {
            return Err(MediaError::Acquisition("capture device busy".to_string()));
        }
        match self.open_device().await {
            Ok(device) => Ok(device),
            Err(e) => {
                self.capture_held.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn release_capture(&self, mut device: Box<dyn CaptureDevice>) {
        device.stop();
        self.capture_held.store(false, Ordering::SeqCst);
        debug!("Capture device released");
    }

    async fn open_playback_sink(&self, kind: SinkKind) -> Result<Box<dyn PlaybackSink>, MediaError> {
        match kind {
            SinkKind::Video => {
                let dir = self.output_dir.join("video");
                tokio::fs::create_dir_all(&dir).await?;
                Ok(Box::new(FrameDirSink::new(dir)))
            }
            SinkKind::Audio => {
                tokio::fs::create_dir_all(&self.output_dir).await?;
                let path = self.output_dir.join("audio.mp3");
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                info!("Writing audio feed to {}", path.display());
                Ok(Box::new(FileSink { file, written: 0 }))
            }
        }
    }
}

/// Keeps only the most recent frame on disk.
struct FrameDirSink {
    dir: PathBuf,
    frames: u64,
}

impl FrameDirSink {
    fn new(dir: PathBuf) -> Self {
        Self { dir, frames: 0 }
    }
}

#[async_trait]
impl PlaybackSink for FrameDirSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), MediaError> {
        let tmp = self.dir.join("latest.jpg.part");
        tokio::fs::write(&tmp, &chunk).await?;
        tokio::fs::rename(&tmp, self.dir.join("latest.jpg")).await?;

        self.frames += 1;
        if self.frames % 300 == 0 {
            debug!("{} video frames written", self.frames);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        info!("Video sink closed after {} frames", self.frames);
        Ok(())
    }
}

struct FileSink {
    file: tokio::fs::File,
    written: u64,
}

#[async_trait]
impl PlaybackSink for FileSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), MediaError> {
        self.file.write_all(&chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        self.file.flush().await?;
        info!("Audio sink closed after {} bytes", self.written);
        Ok(())
    }
}

/// Replays a WebM/Opus file in slice-sized pieces.
pub struct FileCapture {
    path: PathBuf,
    sos: SignalOfStop,
}

impl FileCapture {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            sos: SignalOfStop::new(),
        }
    }
}

#[async_trait]
impl CaptureDevice for FileCapture {
    async fn start(&mut self, slice: Duration) -> Result<mpsc::Receiver<Bytes>, MediaError> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;
        let (tx, rx) = mpsc::channel(16);
        let chunk_len = bytes_per_slice(slice);

        self.sos.spawn(async move {
            let mut ticker = tokio::time::interval(slice);
            loop {
                ticker.tick().await;
                let mut chunk = vec![0u8; chunk_len];
                let n = match file.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                chunk.truncate(n);
                if tx.send(Bytes::from(chunk)).await.is_err() {
                    break;
                }
            }
            debug!("File capture finished");
        });

        Ok(rx)
    }

    fn stop(&mut self) {
        self.sos.cancel();
    }
}
