use std::sync::Arc;

use crate::models::audio::{DeviceIdentity, SourceKind};
use crate::models::error::CaptureError;

/// Callback invoked when a native audio buffer is available.
///
/// Parameters:
/// - `samples`: interleaved f32 samples in the device's native layout.
/// - `sample_rate`: the actual sample rate of the delivered audio.
/// - `channels`: number of interleaved channels.
///
/// The callback fires on a dedicated audio thread and must never block.
pub type NativeBufferCallback = Arc<dyn Fn(&[f32], u32, u16) + Send + Sync + 'static>;

/// Interface for platform-specific audio capture endpoints.
///
/// Implementations own exactly one hardware endpoint and are recreated,
/// never mutated, when the endpoint changes. Implemented by the cpal
/// backend crate and by scripted providers in tests.
pub trait CaptureProvider: Send + Sync {
    /// Whether this endpoint is currently present and openable.
    fn is_available(&self) -> bool;

    /// Start delivering native buffers via `callback`.
    ///
    /// Fails with `CaptureUnavailable` when the endpoint is gone and
    /// `FormatNegotiation` when the native format cannot be captured.
    fn start(&mut self, callback: NativeBufferCallback) -> Result<(), CaptureError>;

    /// Stop capturing and release the device handle. Idempotent.
    fn stop(&mut self) -> Result<(), CaptureError>;

    /// The hardware endpoint backing this provider.
    fn device_info(&self) -> DeviceIdentity;
}

/// Builds a provider for a source, optionally pinned to a device id.
///
/// `device_id = None` requests the platform default endpoint; the
/// coordinator falls back to it after restart retries are exhausted.
pub type ProviderFactory =
    Arc<dyn Fn(Option<&str>) -> Result<Box<dyn CaptureProvider>, CaptureError> + Send + Sync>;

/// Listener for hardware topology changes, invoked with the affected
/// source and a human-readable reason.
///
/// Platform watchers collapse their native notifications into this one
/// callback; it runs on the watcher's thread and must only marshal the
/// event onward (typically into the coordinator's queue).
pub type DeviceChangeListener = Arc<dyn Fn(SourceKind, &str) + Send + Sync + 'static>;
