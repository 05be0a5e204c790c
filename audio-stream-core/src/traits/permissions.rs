use crate::models::audio::SourceKind;

/// Capability check for OS capture consent.
///
/// The host UI owns any prompting flow; this trait only answers whether
/// capture may proceed. `request` returns the post-prompt status and may
/// simply re-check on platforms without a consent dialog.
pub trait PermissionProbe: Send + Sync {
    fn has_capture_permission(&self, kind: SourceKind) -> bool;

    fn request_capture_permission(&self, kind: SourceKind) -> bool;
}

/// Probe for platforms where capture is unrestricted.
pub struct AlwaysAllowed;

impl PermissionProbe for AlwaysAllowed {
    fn has_capture_permission(&self, _kind: SourceKind) -> bool {
        true
    }

    fn request_capture_permission(&self, _kind: SourceKind) -> bool {
        true
    }
}
