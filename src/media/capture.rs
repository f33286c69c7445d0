//! Microphone capture through cpal.
//!
//! cpal streams are not `Send`, so each capture owns a dedicated thread that
//! builds the input stream and keeps it alive until stopped. Samples are
//! down-mixed to mono at the device rate and fed to the WebM/Opus encoder,
//! whose output is buffered; a tokio task flushes the buffer once per time
//! slice.

use crate::error::MediaError;
use crate::media::encode::WebmOpusEncoder;
use crate::media::host::CaptureDevice;
use crate::utils::sos::SignalOfStop;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cpal::{FromSample, Sample, SampleFormat};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type Buffer = Arc<Mutex<BytesMut>>;

/// Muxer output, shared with the slice flush task.
struct SharedWriter(Buffer);

impl std::io::Write for SharedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Averages interleaved frames down to one channel, keeping the rate.
struct Downmix {
    channels: usize,
    mono: Vec<f32>,
}

impl Downmix {
    fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            mono: Vec::new(),
        }
    }

    fn mix<T>(&mut self, input: &[T]) -> &[f32]
    where
        T: Sample,
        f32: FromSample<T>,
    {
        self.mono.clear();
        for frame in input.chunks_exact(self.channels) {
            let sum: f32 = frame.iter().map(|s| (*s).to_sample::<f32>()).sum();
            self.mono.push(sum / self.channels as f32);
        }
        &self.mono
    }
}

struct CaptureEncoder {
    downmix: Downmix,
    encoder: WebmOpusEncoder<SharedWriter>,
    failed: bool,
}

impl CaptureEncoder {
    fn write_input_data<T>(&mut self, input: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        if self.failed {
            return;
        }
        let mono = self.downmix.mix(input);
        if let Err(e) = self.encoder.push(mono) {
            error!("Audio capture encoding stopped: {}", e);
            self.failed = true;
        }
    }
}

pub struct MicrophoneCapture {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    sos: SignalOfStop,
}

impl Default for MicrophoneCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrophoneCapture {
    pub fn new() -> Self {
        Self {
            stop_tx: None,
            sos: SignalOfStop::new(),
        }
    }
}

fn run_stream(buffer: Buffer, ready: oneshot::Sender<Result<(), MediaError>>, stop_rx: std::sync::mpsc::Receiver<()>) {
    let fail = |ready: oneshot::Sender<Result<(), MediaError>>, msg: String| {
        let _ = ready.send(Err(MediaError::Acquisition(msg)));
    };

    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        fail(ready, "no default input device".to_string());
        return;
    };
    let config = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            fail(ready, format!("failed to get default input config: {}", e));
            return;
        }
    };
    info!("Audio capture config: {:?}", config);

    let stream_config: cpal::StreamConfig = config.clone().into();
    let encoder = match WebmOpusEncoder::new(stream_config.sample_rate, SharedWriter(buffer)) {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let mut mixer = CaptureEncoder {
        downmix: Downmix::new(stream_config.channels as usize),
        encoder,
        failed: false,
    };
    let err_fn = |err| error!("Audio stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data, _: &_| mixer.write_input_data::<i16>(data),
            err_fn,
            None,
        ),
        SampleFormat::I32 => device.build_input_stream(
            &stream_config,
            move |data, _: &_| mixer.write_input_data::<i32>(data),
            err_fn,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data, _: &_| mixer.write_input_data::<f32>(data),
            err_fn,
            None,
        ),
        other => {
            fail(ready, format!("unsupported sample format {:?}", other));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            fail(ready, e.to_string());
            return;
        }
    };
    if let Err(e) = stream.play() {
        fail(ready, e.to_string());
        return;
    }

    info!("Audio capture started");
    let _ = ready.send(Ok(()));

    // blocks until stop() or the capture is dropped
    let _ = stop_rx.recv();
    let _ = stream.pause();
    info!("Audio capture stopped");
}

#[async_trait]
impl CaptureDevice for MicrophoneCapture {
    async fn start(&mut self, slice: Duration) -> Result<mpsc::Receiver<Bytes>, MediaError> {
        let buffer: Buffer = Arc::new(Mutex::new(BytesMut::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel();

        let thread_buffer = Arc::clone(&buffer);
        thread::Builder::new()
            .name("xiot-capture".to_string())
            .spawn(move || run_stream(thread_buffer, ready_tx, stop_rx))
            .map_err(|e| MediaError::Acquisition(e.to_string()))?;
        self.stop_tx = Some(stop_tx);

        ready_rx
            .await
            .map_err(|_| MediaError::Acquisition("capture thread exited".to_string()))??;

        let (tx, rx) = mpsc::channel(16);
        self.sos.spawn(async move {
            let mut ticker = tokio::time::interval(slice);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let chunk = {
                    let mut pending = buffer.lock().unwrap_or_else(|p| p.into_inner());
                    pending.split().freeze()
                };
                if chunk.is_empty() {
                    continue;
                }
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    fn stop(&mut self) {
        self.sos.cancel();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
