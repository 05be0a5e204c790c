//! # audio-stream-cpal
//!
//! cpal backend for audio-stream-core.
//!
//! Provides:
//! - `CpalMicCapture` — microphone capture on a dedicated stream thread
//! - `CpalLoopbackCapture` — system audio via WASAPI loopback (Windows)
//!   or monitor sources (PulseAudio/PipeWire)
//! - `DeviceCatalog` — device enumeration
//! - `DeviceWatcher` — polling topology watcher feeding device-change
//!   notifications into the session
//! - `CpalPermissionProbe` — capture consent check by probing the device
//!
//! ## Usage
//! ```ignore
//! use audio_stream_core::{CaptureSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     endpoint: "ws://localhost:9000/ws/ingest/meeting-1".into(),
//!     device_id: "desktop-1".into(),
//!     ..Default::default()
//! };
//! let session = CaptureSession::start(config, audio_stream_cpal::session_backends()).await?;
//! ```

use std::sync::Arc;

use audio_stream_core::session::SessionBackends;
use audio_stream_core::traits::capture_provider::{CaptureProvider, ProviderFactory};
use audio_stream_core::traits::transport::{StreamTransport, TransportFactory};
use audio_stream_core::transport::WsTransport;
use audio_stream_core::models::audio::SourceKind;
use audio_stream_core::models::config::SessionConfig;

pub mod devices;
pub mod loopback;
pub mod mic;
pub mod permissions;
pub mod watcher;
mod worker;

pub use devices::DeviceCatalog;
pub use loopback::CpalLoopbackCapture;
pub use mic::CpalMicCapture;
pub use permissions::CpalPermissionProbe;
pub use watcher::DeviceWatcher;

/// Provider factory for microphone endpoints.
pub fn mic_factory() -> ProviderFactory {
    Arc::new(|device_id: Option<&str>| {
        Ok(Box::new(CpalMicCapture::new(device_id.map(str::to_string)))
            as Box<dyn CaptureProvider>)
    })
}

/// Provider factory for system-audio endpoints.
pub fn system_factory() -> ProviderFactory {
    Arc::new(|device_id: Option<&str>| {
        Ok(
            Box::new(CpalLoopbackCapture::new(device_id.map(str::to_string)))
                as Box<dyn CaptureProvider>,
        )
    })
}

/// Transport factory opening one WebSocket per source.
pub fn ws_transport_factory() -> TransportFactory {
    Arc::new(|source: SourceKind, config: &SessionConfig| {
        Arc::new(WsTransport::for_source(source, config)) as Arc<dyn StreamTransport>
    })
}

/// The full set of platform pieces a session needs on this backend.
pub fn session_backends() -> SessionBackends {
    SessionBackends {
        mic_factory: mic_factory(),
        system_factory: system_factory(),
        permissions: Arc::new(CpalPermissionProbe),
        transport_factory: ws_transport_factory(),
    }
}
