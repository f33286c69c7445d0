//! Push-to-talk audio encoding: mono samples at the device rate are resampled
//! to 48 kHz, encoded with libopus and muxed into a live WebM stream, which
//! is what the device's `/ws/audio` endpoint pipes into its player.

use crate::error::MediaError;
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioEncoder, AudioFrameMut, AudioResampler, ChannelLayout};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use log::debug;
use std::io::Write;

pub const OPUS_SAMPLE_RATE: u32 = 48_000;
pub const OPUS_BIT_RATE: u64 = 32_000;

/// Resampler input is cut into 10 ms frames of the source rate.
const INPUT_FRAME_MS: u32 = 10;

fn mono() -> Result<ChannelLayout, MediaError> {
    ChannelLayout::from_channels(1).ok_or_else(|| MediaError::Encoding("no mono channel layout".to_string()))
}

pub struct WebmOpusEncoder<W: Write> {
    resampler: AudioResampler,
    encoder: AudioEncoder,
    muxer: Muxer<W>,
    layout: ChannelLayout,
    source_rate: u32,
    input_frame: usize,
    pending: Vec<f32>,
    pushed: i64,
    encoded_samples: u64,
}

impl<W: Write> WebmOpusEncoder<W> {
    /// Everything written to `output`, from the WebM header on, is one
    /// continuous stream.
    pub fn new(source_rate: u32, output: W) -> Result<Self, MediaError> {
        let flt = get_sample_format("flt");

        let encoder = AudioEncoder::builder("libopus")?
            .sample_rate(OPUS_SAMPLE_RATE)
            .channel_layout(mono()?)
            .sample_format(flt)
            .time_base(TimeBase::new(1, OPUS_SAMPLE_RATE as i32))
            .bit_rate(OPUS_BIT_RATE)
            .set_option("frame_duration", "20")
            .set_option("application", "voip")
            .build()?;

        let resampler = AudioResampler::builder()
            .source_channel_layout(mono()?)
            .source_sample_format(flt)
            .source_sample_rate(source_rate)
            .target_channel_layout(mono()?)
            .target_sample_format(flt)
            .target_sample_rate(OPUS_SAMPLE_RATE)
            .target_frame_samples(encoder.samples_per_frame())
            .build()?;

        let format = OutputFormat::find_by_name("webm")
            .ok_or_else(|| MediaError::Encoding("webm muxer not available".to_string()))?;
        let mut builder = Muxer::builder();
        builder.add_stream(&CodecParameters::from(encoder.codec_parameters()))?;
        let muxer = builder
            .set_option("live", "1")
            .set_option("cluster_time_limit", "100")
            .set_option("flush_packets", "1")
            .build(IO::from_write_stream(output), format)?;

        debug!("WebM/Opus encoder ready, {} Hz in, {} Hz out", source_rate, OPUS_SAMPLE_RATE);
        Ok(Self {
            resampler,
            encoder,
            muxer,
            layout: mono()?,
            source_rate,
            input_frame: (source_rate * INPUT_FRAME_MS / 1000).max(1) as usize,
            pending: Vec::new(),
            pushed: 0,
            encoded_samples: 0,
        })
    }

    /// Samples handed to the Opus encoder so far, at 48 kHz.
    pub fn encoded_samples(&self) -> u64 {
        self.encoded_samples
    }

    /// Queues mono samples at the source rate, encoding every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Result<(), MediaError> {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.input_frame {
            let frame: Vec<f32> = self.pending.drain(..self.input_frame).collect();
            self.resample(&frame)?;
        }
        Ok(())
    }

    /// Encodes what is left, writes the trailer and hands the output back.
    pub fn finish(mut self) -> Result<W, MediaError> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.resample(&rest)?;
        }

        self.resampler.flush()?;
        self.drain_resampler()?;
        self.encoder.flush()?;
        self.drain_encoder()?;
        self.muxer.flush()?;

        Ok(self.muxer.close()?.into_stream())
    }

    fn resample(&mut self, samples: &[f32]) -> Result<(), MediaError> {
        let time_base = TimeBase::new(1, self.source_rate as i32);
        let mut frame = AudioFrameMut::silence(&self.layout, get_sample_format("flt"), self.source_rate, samples.len())
            .with_time_base(time_base)
            .with_pts(Timestamp::new(self.pushed, time_base));

        let plane = &mut frame.planes_mut()[0];
        for (dst, sample) in plane.data_mut().chunks_exact_mut(4).zip(samples) {
            dst.copy_from_slice(&sample.to_ne_bytes());
        }
        self.pushed += samples.len() as i64;

        self.resampler.push(frame.freeze())?;
        self.drain_resampler()
    }

    fn drain_resampler(&mut self) -> Result<(), MediaError> {
        while let Some(frame) = self.resampler.take()? {
            self.encoded_samples += frame.samples() as u64;
            self.encoder.push(frame)?;
            self.drain_encoder()?;
        }
        Ok(())
    }

    fn drain_encoder(&mut self) -> Result<(), MediaError> {
        while let Some(packet) = self.encoder.take()? {
            self.muxer.push(packet.with_stream_index(0))?;
        }
        Ok(())
    }
}
