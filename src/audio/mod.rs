//! Microphone and speaker seams.
//!
//! The session only talks to [`CaptureDevice`] and [`PlaybackSink`]; the
//! cpal-backed implementations live in [`device`] behind the `audio-cpal`
//! feature.

mod capture;
pub mod device;

use async_trait::async_trait;

pub use capture::{CaptureBuffer, CaptureState};
pub use device::{Microphone, Speaker};

use crate::Result;

/// A source of raw PCM16 frames.
///
/// `start` hands the device the shared buffer; the device keeps pushing
/// frames from its own thread until `stop`.
pub trait CaptureDevice: Send {
    /// # Errors
    /// Returns `AudioDevice` if the device cannot be opened.
    fn start(&mut self, buffer: CaptureBuffer) -> Result<()>;

    /// Release the device. Safe to call more than once.
    fn stop(&mut self);
}

/// Plays one complete PCM16 payload, returning when playback has finished.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// # Errors
    /// Returns `Playback` when the output device fails.
    async fn play(&self, pcm: Vec<u8>) -> Result<()>;
}

/// Capture device for sessions that never listen (text prompts only).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl CaptureDevice for NoCapture {
    fn start(&mut self, _buffer: CaptureBuffer) -> Result<()> {
        tracing::debug!("Capture disabled");
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Sink that drops audio, for text-only sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSink;

#[async_trait]
impl PlaybackSink for SilentSink {
    async fn play(&self, pcm: Vec<u8>) -> Result<()> {
        tracing::debug!(bytes = pcm.len(), "Discarding assistant audio");
        Ok(())
    }
}
