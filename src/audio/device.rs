//! cpal-backed microphone and speaker.
//!
//! `cpal::Stream` is `!Send` on most platforms, so each stream is built and
//! dropped on one dedicated OS thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use async_trait::async_trait;

use super::{CaptureBuffer, CaptureDevice, PlaybackSink};
use crate::{Error, Result};

/// Default input device, mono PCM16 at the session sample rate.
pub struct Microphone {
    sample_rate: u32,
    chunk_frames: u32,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Microphone {
    #[must_use]
    pub fn new(sample_rate: u32, chunk_frames: u32) -> Self {
        Self {
            sample_rate,
            chunk_frames,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl CaptureDevice for Microphone {
    fn start(&mut self, buffer: CaptureBuffer) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let (sample_rate, chunk_frames) = (self.sample_rate, self.chunk_frames);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        let worker = std::thread::Builder::new()
            .name("kubewhisper-mic".to_string())
            .spawn(move || {
                let stream = match backend::open_input(sample_rate, chunk_frames, buffer) {
                    Ok(stream) => {
                        let _ = open_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = open_tx.send(Err(err));
                        return;
                    }
                };
                while running.load(Ordering::Acquire) {
                    std::thread::park_timeout(std::time::Duration::from_millis(100));
                }
                drop(stream);
                tracing::info!("Microphone closed");
            })?;

        match open_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(err)) => {
                self.running.store(false, Ordering::Release);
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                self.running.store(false, Ordering::Release);
                Err(Error::AudioDevice("capture thread exited before opening the device".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                tracing::warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default output device. Each `play` opens a short-lived stream.
#[derive(Debug, Clone, Copy)]
pub struct Speaker {
    sample_rate: u32,
}

impl Speaker {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl PlaybackSink for Speaker {
    async fn play(&self, pcm: Vec<u8>) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        let sample_rate = self.sample_rate;
        tracing::info!(bytes = pcm.len(), "Playing assistant audio");
        tokio::task::spawn_blocking(move || backend::play_blocking(sample_rate, &pcm))
            .await
            .map_err(|err| Error::Playback(err.to_string()))?
    }
}

/// Little-endian PCM16 to `f32` samples at `to_rate`, linearly interpolated.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn pcm16_to_f32(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let samples: Vec<f32> = pcm
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect();
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples;
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let len = (samples.len() as f64 / ratio) as usize;
    (0..len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples.get(idx).copied().unwrap_or(0.0);
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(feature = "audio-cpal")]
mod backend {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BufferSize, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

    use crate::audio::CaptureBuffer;
    use crate::{Error, Result};

    const PLAYBACK_GRACE: Duration = Duration::from_secs(2);

    #[allow(clippy::cast_possible_truncation)]
    fn f32_to_i16(sample: f32) -> i16 {
        (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
    }

    fn push_mono<T: Copy>(scratch: &mut Vec<u8>, data: &[T], channels: usize, to_i16: impl Fn(T) -> i16) {
        scratch.clear();
        for frame in data.chunks(channels.max(1)) {
            let sum: i32 = frame.iter().map(|s| i32::from(to_i16(*s))).sum();
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let mixed = (sum / frame.len() as i32) as i16;
            scratch.extend_from_slice(&mixed.to_le_bytes());
        }
    }

    pub(super) fn open_input(sample_rate: u32, chunk_frames: u32, buffer: CaptureBuffer) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::AudioDevice("no default input device".to_string()))?;
        tracing::info!(device = device.name().unwrap_or_default().as_str(), "Opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| Error::AudioDevice(e.to_string()))?;
        let channels = supported.channels();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Fixed(chunk_frames),
        };
        let ch = usize::from(channels);
        let on_error = |err: cpal::StreamError| tracing::warn!("Input stream status: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        push_mono(&mut scratch, data, ch, |s| s);
                        buffer.push_frame(&scratch);
                    },
                    on_error,
                    None,
                )
            }
            SampleFormat::F32 => {
                let mut scratch = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        push_mono(&mut scratch, data, ch, f32_to_i16);
                        buffer.push_frame(&scratch);
                    },
                    on_error,
                    None,
                )
            }
            fmt => {
                return Err(Error::AudioDevice(format!("unsupported input sample format: {fmt:?}")));
            }
        }
        .map_err(|e| Error::AudioDevice(e.to_string()))?;

        stream.play().map_err(|e| Error::AudioDevice(e.to_string()))?;
        tracing::info!(sample_rate, channels, chunk_frames, "Microphone opened");
        Ok(stream)
    }

    #[allow(clippy::cast_precision_loss)]
    pub(super) fn play_blocking(sample_rate: u32, pcm: &[u8]) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no default output device".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| Error::Playback(e.to_string()))?;
        let device_rate = supported.sample_rate().0;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(device_rate),
            buffer_size: BufferSize::Default,
        };

        let samples = super::pcm16_to_f32(pcm, sample_rate, device_rate);
        let total = samples.len();
        let finished = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => output_stream::<f32>(&device, &config, samples, Arc::clone(&finished)),
            SampleFormat::I16 => output_stream::<i16>(&device, &config, samples, Arc::clone(&finished)),
            SampleFormat::U16 => output_stream::<u16>(&device, &config, samples, Arc::clone(&finished)),
            fmt => return Err(Error::Playback(format!("unsupported output sample format: {fmt:?}"))),
        }?;
        stream.play().map_err(|e| Error::Playback(e.to_string()))?;
        tracing::debug!(device_rate, format = ?supported.sample_format(), "Output stream started");

        let expected = Duration::from_secs_f64(total as f64 / f64::from(device_rate.max(1)));
        let deadline = Instant::now() + expected + PLAYBACK_GRACE;
        while !finished.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return Err(Error::Playback("output stream stalled".to_string()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        // Let the device flush its last period before the stream is dropped.
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    }

    fn output_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        samples: Vec<f32>,
        finished: Arc<AtomicBool>,
    ) -> Result<Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = usize::from(config.channels).max(1);
        let mut position = 0usize;
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _info| {
                    for frame in data.chunks_mut(channels) {
                        let value = samples.get(position).copied().unwrap_or(0.0);
                        frame.fill(T::from_sample(value));
                        position += 1;
                    }
                    if position >= samples.len() {
                        finished.store(true, Ordering::Release);
                    }
                },
                |err: cpal::StreamError| tracing::warn!("Output stream status: {err}"),
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))
    }
}

#[cfg(not(feature = "audio-cpal"))]
mod backend {
    use crate::audio::CaptureBuffer;
    use crate::{Error, Result};

    const DISABLED: &str = "compiled without audio-cpal feature";

    pub(super) struct Stream;

    pub(super) fn open_input(_sample_rate: u32, _chunk_frames: u32, _buffer: CaptureBuffer) -> Result<Stream> {
        Err(Error::AudioDevice(DISABLED.to_string()))
    }

    pub(super) fn play_blocking(_sample_rate: u32, _pcm: &[u8]) -> Result<()> {
        Err(Error::Playback(DISABLED.to_string()))
    }
}
