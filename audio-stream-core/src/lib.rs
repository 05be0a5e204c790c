//! # audio-stream-core
//!
//! Platform-agnostic capture-and-stream core library.
//!
//! Captures microphone and system audio through pluggable providers,
//! normalizes everything to 16 kHz mono PCM16, and streams it over a
//! resilient WebSocket transport to a live transcription service.
//! Platform backends (cpal, or anything else) implement the
//! `CaptureProvider` trait and plug into the generic `CaptureSession`.
//!
//! ## Architecture
//!
//! ```text
//! audio-stream-core (this crate)
//! ├── traits/       ← CaptureProvider, PermissionProbe, StreamTransport
//! ├── models/       ← CaptureError, SourceState, SessionConfig, SessionEvent, etc.
//! ├── processing/   ← FormatConverter (downmix/resample/quantize), PcmRing
//! ├── capture/      ← ManagedSource (warm-up, pause gate, hand-off)
//! ├── coordinator/  ← DeviceChangeCoordinator (debounce, serialize, fallback)
//! ├── transport/    ← wire protocol + WsTransport (handshake, reconnect, ring)
//! └── session/      ← CaptureSession (generic orchestrator)
//! ```

pub mod capture;
pub mod coordinator;
pub mod models;
pub mod processing;
pub mod session;
pub mod traits;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use capture::ManagedSource;
pub use coordinator::{CoordinatorConfig, DeviceChangeCoordinator, RestartExecutor};
pub use models::audio::{
    AudioFrame, AudioLevels, DeviceDirection, DeviceIdentity, SourceDiagnostics, SourceKind,
};
pub use models::config::SessionConfig;
pub use models::error::CaptureError;
pub use models::events::{SessionEvent, TranscriptEvent, TranscriptKind};
pub use models::state::{SourceState, TransportState};
pub use processing::converter::FormatConverter;
pub use processing::pcm_ring::PcmRing;
pub use session::{CaptureSession, SessionBackends};
pub use traits::capture_provider::{
    CaptureProvider, DeviceChangeListener, NativeBufferCallback, ProviderFactory,
};
pub use traits::permissions::{AlwaysAllowed, PermissionProbe};
pub use traits::transport::{ControlKind, StreamTransport, TransportEvent, TransportFactory};
pub use transport::{TransportDiagnostics, WsConfig, WsTransport};
