/// Capture source state machine.
///
/// State transitions:
/// ```text
/// Stopped → Starting → Running
///              ↑          ↓ (device change)
///              |      Restarting → Running
///              |          ↓ (retries exhausted)
///              |       Degraded
/// any state → Stopped on stop() or fatal error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Stopped,
    Starting,
    Running,
    Restarting,
    /// Running on the platform default device after the configured device
    /// could not be recovered.
    Degraded,
}

impl SourceState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }

    pub fn is_restarting(&self) -> bool {
        matches!(self, Self::Restarting)
    }

    /// Whether frames are expected to flow in this state.
    pub fn delivers_frames(&self) -> bool {
        self.is_running()
    }
}

/// Transport connection state machine.
///
/// ```text
/// Idle → Connecting → Connected → Closing → Disconnected
///            ↑                                   |
///            └────────── automatic reconnect ────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Disconnected,
}

impl TransportState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}
