use std::time::Duration;

/// Configuration for one capture-and-stream session.
///
/// Supplied at session start and on reconfiguration. `capture_eq` decides
/// whether a reconfiguration can keep capture running and only rebuild
/// the transports.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Canonical sample rate sent over the wire (default: 16000).
    pub target_sample_rate: u32,

    /// Canonical channel count (the ingest protocol accepts only mono).
    pub channels: u16,

    /// BCP-47-ish language tag forwarded in the handshake.
    pub language: String,

    /// WebSocket ingest endpoint, e.g. `ws://host/ws/ingest/{meeting}`.
    pub endpoint: String,

    /// Bearer token attached to the upgrade request.
    pub auth_token: String,

    /// Stable identifier for this installation, sent in the handshake.
    pub device_id: String,

    /// Specific microphone device id, or None for the platform default.
    pub mic_device_id: Option<String>,

    /// Enable microphone capture (default: true).
    pub enable_mic: bool,

    /// Enable system-output capture (default: true).
    pub enable_system: bool,

    /// Capture callbacks discarded after each (re)start while hardware
    /// settles (default: 3).
    pub warmup_frames: u32,

    /// Per-source transport ring buffer window (default: 500 ms).
    pub ring_window: Duration,

    /// Largest binary PCM payload sent in one frame (default: 32 KiB).
    pub max_frame_bytes: usize,

    /// Device-change debounce window (default: 400 ms).
    pub debounce_window: Duration,

    /// Pause between stopping a source and restarting it (default: 200 ms).
    pub settle_delay: Duration,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(8000..=48000).contains(&self.target_sample_rate) {
            return Err(format!(
                "target sample rate out of range: {}",
                self.target_sample_rate
            ));
        }
        if self.channels != 1 {
            return Err(format!("unsupported channel count: {}", self.channels));
        }
        if self.endpoint.is_empty() {
            return Err("endpoint must not be empty".into());
        }
        if self.device_id.is_empty() {
            return Err("device id must not be empty".into());
        }
        if self.max_frame_bytes == 0 {
            return Err("max frame bytes must be positive".into());
        }
        if !self.enable_mic && !self.enable_system {
            return Err("at least one source must be enabled".into());
        }
        Ok(())
    }

    /// Whether `other` differs only in transport-level settings, so a
    /// reconfiguration can leave capture running.
    pub fn capture_eq(&self, other: &Self) -> bool {
        self.target_sample_rate == other.target_sample_rate
            && self.channels == other.channels
            && self.mic_device_id == other.mic_device_id
            && self.enable_mic == other.enable_mic
            && self.enable_system == other.enable_system
            && self.warmup_frames == other.warmup_frames
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000,
            channels: 1,
            language: "en".into(),
            endpoint: String::new(),
            auth_token: String::new(),
            device_id: String::new(),
            mic_device_id: None,
            enable_mic: true,
            enable_system: true,
            warmup_frames: 3,
            ring_window: Duration::from_millis(500),
            max_frame_bytes: 32 * 1024,
            debounce_window: Duration::from_millis(400),
            settle_delay: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SessionConfig {
        SessionConfig {
            endpoint: "ws://localhost:9000/ws/ingest/m1".into(),
            device_id: "dev-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_needs_endpoint_and_device() {
        assert!(SessionConfig::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_stereo() {
        let mut config = valid();
        config.channels = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn language_change_is_transport_only() {
        let base = valid();
        let mut changed = base.clone();
        changed.language = "tr".into();
        changed.auth_token = "refreshed".into();
        assert!(base.capture_eq(&changed));

        changed.target_sample_rate = 8000;
        assert!(!base.capture_eq(&changed));
    }
}
