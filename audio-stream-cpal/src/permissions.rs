//! Capture permission probe built on device access.
//!
//! cpal exposes no consent API, so the probe checks whether the default
//! endpoint can be negotiated: a denied OS privacy toggle surfaces as a
//! config/open failure. The OS shows its own prompt, if any, on first
//! open; there is no dialog to drive from here, so `request` re-checks.

use cpal::traits::{DeviceTrait, HostTrait};

use audio_stream_core::models::audio::SourceKind;
use audio_stream_core::traits::permissions::PermissionProbe;

pub struct CpalPermissionProbe;

impl PermissionProbe for CpalPermissionProbe {
    fn has_capture_permission(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Mic => cpal::default_host()
                .default_input_device()
                .map(|d| d.default_input_config().is_ok())
                .unwrap_or(false),
            // Loopback reads the output mix, which needs no consent.
            SourceKind::System => true,
        }
    }

    fn request_capture_permission(&self, kind: SourceKind) -> bool {
        self.has_capture_permission(kind)
    }
}
