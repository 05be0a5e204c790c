use std::collections::VecDeque;
use std::time::Duration;

use crate::models::audio::AudioFrame;
use crate::models::error::CaptureError;

/// Bounded time-window buffer of PCM frames awaiting transmission.
///
/// Holds whole frames rather than raw samples so buffered audio flushes
/// in original frame boundaries after a reconnect. Overflow drops the
/// oldest frames first; the buffered duration never exceeds the window.
#[derive(Debug)]
pub struct PcmRing {
    frames: VecDeque<AudioFrame>,
    window_ms: u64,
    buffered_ms: u64,
    evicted_frames: u64,
    overruns: u64,
}

impl PcmRing {
    pub fn new(window: Duration) -> Self {
        Self {
            frames: VecDeque::new(),
            window_ms: window.as_millis() as u64,
            buffered_ms: 0,
            evicted_frames: 0,
            overruns: 0,
        }
    }

    /// Append a frame, evicting oldest frames until the window holds.
    ///
    /// A single frame longer than the whole window cannot be held; it is
    /// counted and reported as an overrun so callers can surface it.
    pub fn push(&mut self, frame: AudioFrame) -> Result<(), CaptureError> {
        let frame_ms = frame.duration_ms();
        if frame_ms > self.window_ms {
            self.overruns += 1;
            return Err(CaptureError::BufferOverrun);
        }

        while self.buffered_ms + frame_ms > self.window_ms {
            match self.frames.pop_front() {
                Some(evicted) => {
                    self.buffered_ms -= evicted.duration_ms();
                    self.evicted_frames += 1;
                }
                None => break,
            }
        }

        self.buffered_ms += frame_ms;
        self.frames.push_back(frame);
        Ok(())
    }

    /// Remove and return all buffered frames, oldest first.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.buffered_ms = 0;
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.buffered_ms = 0;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total audio duration currently buffered.
    pub fn buffered(&self) -> Duration {
        Duration::from_millis(self.buffered_ms)
    }

    /// Frames dropped to keep the window bound.
    pub fn evicted_frames(&self) -> u64 {
        self.evicted_frames
    }

    /// Frames that could not be held at all.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}
