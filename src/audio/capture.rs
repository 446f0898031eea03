use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

/// Microphone gate. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    Idle = 0,
    /// Frames from the device are accepted into the buffer.
    Recording = 1,
    /// The assistant is answering; frames are dropped so it never hears itself.
    Receiving = 2,
}

impl CaptureState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Recording,
            2 => Self::Receiving,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Receiving => "receiving",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
struct Shared {
    frames: Mutex<Vec<u8>>,
    state: AtomicU8,
    resume_after_receiving: AtomicBool,
}

/// Hand-off between the device callback thread and the session.
///
/// The device side only calls [`push_frame`](Self::push_frame). State
/// transitions are made by the dispatcher; the capture-forward loop only
/// reads [`state`](Self::state) and calls [`drain`](Self::drain).
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    shared: Arc<Shared>,
}

impl CaptureBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn set_state(&self, next: CaptureState) {
        let prev = CaptureState::from_u8(self.shared.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "Capture state changed");
        }
    }

    /// Begin accepting frames.
    ///
    /// While the assistant is being received the request is remembered and
    /// applied by [`finish_receiving`](Self::finish_receiving) instead.
    pub fn start_capture(&self) {
        match self.state() {
            CaptureState::Idle => {
                self.set_state(CaptureState::Recording);
                tracing::info!("Started recording");
            }
            CaptureState::Recording => {}
            CaptureState::Receiving => {
                self.shared.resume_after_receiving.store(true, Ordering::Release);
                tracing::debug!("Recording resumes once the response finishes");
            }
        }
    }

    pub fn stop_capture(&self) {
        self.shared.resume_after_receiving.store(false, Ordering::Release);
        if self.state() == CaptureState::Recording {
            self.set_state(CaptureState::Idle);
            tracing::info!("Stopped recording");
        }
    }

    /// Suppress capture while an assistant response streams in.
    pub fn begin_receiving(&self) {
        self.shared.resume_after_receiving.store(false, Ordering::Release);
        self.set_state(CaptureState::Receiving);
    }

    /// Leave the receiving state, returning to `Idle` (or `Recording` if a
    /// resume was requested meanwhile).
    pub fn finish_receiving(&self) {
        if self.state() != CaptureState::Receiving {
            tracing::debug!("Already not receiving, no action taken");
            return;
        }
        if self.shared.resume_after_receiving.swap(false, Ordering::AcqRel) {
            self.set_state(CaptureState::Recording);
        } else {
            self.set_state(CaptureState::Idle);
        }
    }

    /// Append one device frame. Returns whether it was kept.
    pub fn push_frame(&self, frame: &[u8]) -> bool {
        if self.state() != CaptureState::Recording {
            return false;
        }
        self.shared.frames.lock().extend_from_slice(frame);
        true
    }

    /// Take everything buffered so far without waiting.
    #[must_use]
    pub fn drain(&self) -> Option<Vec<u8>> {
        let mut frames = self.shared.frames.lock();
        if frames.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *frames))
    }

    pub fn clear(&self) {
        self.shared.frames.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_only_enter_while_recording() {
        let buffer = CaptureBuffer::new();
        assert!(!buffer.push_frame(&[1, 2]));
        buffer.start_capture();
        assert!(buffer.push_frame(&[1, 2]));
        assert!(buffer.push_frame(&[3]));
        buffer.begin_receiving();
        assert!(!buffer.push_frame(&[9]));
        assert_eq!(buffer.drain(), Some(vec![1, 2, 3]));
        assert_eq!(buffer.drain(), None);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let buffer = CaptureBuffer::new();
        buffer.start_capture();
        buffer.start_capture();
        assert_eq!(buffer.state(), CaptureState::Recording);
        buffer.stop_capture();
        buffer.stop_capture();
        assert_eq!(buffer.state(), CaptureState::Idle);
    }

    #[test]
    fn receiving_returns_to_idle() {
        let buffer = CaptureBuffer::new();
        buffer.start_capture();
        buffer.begin_receiving();
        assert_eq!(buffer.state(), CaptureState::Receiving);
        buffer.finish_receiving();
        assert_eq!(buffer.state(), CaptureState::Idle);
        buffer.finish_receiving();
        assert_eq!(buffer.state(), CaptureState::Idle);
    }

    #[test]
    fn resume_during_receiving_is_deferred() {
        let buffer = CaptureBuffer::new();
        buffer.begin_receiving();
        buffer.start_capture();
        assert_eq!(buffer.state(), CaptureState::Receiving);
        assert!(!buffer.push_frame(&[1]));
        buffer.finish_receiving();
        assert_eq!(buffer.state(), CaptureState::Recording);
    }

    #[test]
    fn device_thread_can_push_concurrently() {
        let buffer = CaptureBuffer::new();
        buffer.start_capture();
        let writer = buffer.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                writer.push_frame(&[0u8; 4]);
            }
        });
        handle.join().unwrap();
        assert_eq!(buffer.drain().map(|b| b.len()), Some(400));
    }
}
