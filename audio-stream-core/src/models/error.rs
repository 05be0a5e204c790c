use thiserror::Error;

/// Errors that can occur while capturing or streaming audio.
///
/// Capture and transport recover from most of these locally (device
/// restart, reconnect with backoff); only exhausted retries and
/// non-recoverable failures such as permission denial surface upward.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no capture device available")]
    CaptureUnavailable,

    #[error("capture permission denied")]
    PermissionDenied,

    #[error("format negotiation failed: {0}")]
    FormatNegotiation(String),

    #[error("device change timed out: {0}")]
    DeviceChangeTimeout(String),

    #[error("transport handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("transport send failed: {0}")]
    SendFailed(String),

    #[error("transport protocol error: {0}")]
    Protocol(String),

    #[error("ring buffer overrun")]
    BufferOverrun,

    #[error("configuration invalid: {0}")]
    Configuration(String),
}

impl CaptureError {
    /// Whether local retry policy applies. Permission denial and bad
    /// configuration never recover on their own.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::PermissionDenied | Self::Configuration(_))
    }
}
