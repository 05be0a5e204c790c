use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::models::audio::{AudioFrame, SourceKind};
use crate::models::config::SessionConfig;
use crate::models::error::CaptureError;
use crate::models::events::TranscriptEvent;
use crate::models::state::TransportState;

/// Lifecycle signals serialized as JSON text frames, distinct from
/// binary audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Periodic heartbeat while no audio flows.
    KeepAlive,
    /// Ask the far end to flush pending results.
    Finalize,
    /// Announce the end of the stream before a graceful close.
    CloseStream,
}

/// Events a transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    Transcript(TranscriptEvent),
    /// Discrete error (send failure, malformed inbound payload). The
    /// transport keeps running; reconnection is its own concern.
    Error(String),
}

/// Duplex channel to the transcription service for one logical source.
///
/// Implementations hide connection churn from the capture pipeline:
/// `send_pcm` never fails due to a dropped connection, it buffers into a
/// bounded ring instead. Swappable behind this trait so the backend mode
/// is selected once at session start.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    fn state(&self) -> TransportState;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Open the channel and complete the handshake. Resolves once the
    /// far end confirmed the handshake, not merely on socket open.
    async fn connect(&self) -> Result<(), CaptureError>;

    /// Queue one canonical PCM frame for transmission.
    ///
    /// While not Connected the frame lands in the ring buffer; buffered
    /// frames flush oldest-first on reconnect. Frames above the payload
    /// cap are rejected with `SendFailed` and never partially sent.
    async fn send_pcm(&self, frame: AudioFrame) -> Result<(), CaptureError>;

    async fn send_control(&self, kind: ControlKind) -> Result<(), CaptureError>;

    /// Finalize, await acknowledgement up to a bounded timeout, tear
    /// down. Idempotent; always leaves the transport Disconnected.
    async fn close(&self) -> Result<(), CaptureError>;
}

/// Builds the transport for one source. The implementation (direct ASR
/// endpoint vs. intermediary backend) is chosen here, at session start.
pub type TransportFactory =
    std::sync::Arc<dyn Fn(SourceKind, &SessionConfig) -> std::sync::Arc<dyn StreamTransport> + Send + Sync>;
