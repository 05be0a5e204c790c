use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical audio source within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Mic,
    System,
}

impl SourceKind {
    /// Wire identifier. The ingest protocol names the system-output
    /// source `sys`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Mic => "mic",
            Self::System => "sys",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Which way audio flows through a hardware endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// A hardware audio endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: String,
    pub display_name: String,
    pub direction: DeviceDirection,
    pub is_default: bool,
}

/// One chunk of canonical PCM on its way to the transport.
///
/// `pcm` is mono little-endian PCM16 at `sample_rate`. `captured_at` is
/// monotonic; frames from one source never reorder downstream.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub source: SourceKind,
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Duration of audio carried by this frame.
    pub fn duration_ms(&self) -> u64 {
        let samples = (self.pcm.len() / 2) as u64;
        samples * 1000 / self.sample_rate as u64
    }
}

/// Real-time level metering per source (RMS and peak, 0.0–1.0).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioLevels {
    pub rms: f32,
    pub peak: f32,
}

/// Counters for debugging a capture pipeline.
#[derive(Debug, Clone, Default)]
pub struct SourceDiagnostics {
    pub callback_count: u64,
    pub warmup_discards: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub paused_discards: u64,
}
