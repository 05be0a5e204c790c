//! Session orchestration: capture sources, transports, and the device
//! change coordinator wired into one lifecycle.
//!
//! A session owns one `ManagedSource` and one transport per enabled
//! source. Frames travel source -> bounded channel -> pump task ->
//! transport; transcripts and state changes travel back through one
//! unified broadcast of `SessionEvent`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use async_trait::async_trait;

use crate::capture::ManagedSource;
use crate::coordinator::{CoordinatorConfig, DeviceChangeCoordinator, RestartExecutor};
use crate::models::audio::{AudioFrame, AudioLevels, SourceDiagnostics, SourceKind};
use crate::models::config::SessionConfig;
use crate::models::error::CaptureError;
use crate::models::events::SessionEvent;
use crate::models::state::{SourceState, TransportState};
use crate::processing::converter::FormatConverter;
use crate::traits::capture_provider::ProviderFactory;
use crate::traits::permissions::PermissionProbe;
use crate::traits::transport::{
    ControlKind, StreamTransport, TransportEvent, TransportFactory,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const FRAME_CHANNEL_CAPACITY: usize = 64;
/// Emit a Levels event every this many forwarded frames.
const LEVELS_INTERVAL_FRAMES: u32 = 10;

/// Platform pieces injected at session start. All behind traits so the
/// session is testable without hardware or a network.
#[derive(Clone)]
pub struct SessionBackends {
    pub mic_factory: ProviderFactory,
    pub system_factory: ProviderFactory,
    pub permissions: Arc<dyn PermissionProbe>,
    pub transport_factory: TransportFactory,
}

/// Shared slot so pump tasks survive a transport-only reconfiguration.
type TransportSlot = Arc<Mutex<Arc<dyn StreamTransport>>>;

/// The managed sources of one session, addressed by kind. Doubles as the
/// coordinator's restart executor.
#[derive(Default)]
struct SourceSet {
    sources: Mutex<BTreeMap<SourceKind, Arc<ManagedSource>>>,
}

impl SourceSet {
    fn insert(&self, kind: SourceKind, source: Arc<ManagedSource>) {
        self.sources.lock().insert(kind, source);
    }

    fn get(&self, kind: SourceKind) -> Option<Arc<ManagedSource>> {
        self.sources.lock().get(&kind).cloned()
    }

    fn drain(&self) -> Vec<Arc<ManagedSource>> {
        let mut sources = self.sources.lock();
        let drained = sources.values().cloned().collect();
        sources.clear();
        drained
    }
}

#[async_trait]
impl RestartExecutor for SourceSet {
    async fn begin_restart(&self, source: SourceKind) {
        if let Some(managed) = self.get(source) {
            managed.begin_restart();
        }
    }

    async fn complete_restart(
        &self,
        source: SourceKind,
        fallback_default: bool,
    ) -> Result<(), CaptureError> {
        match self.get(source) {
            Some(managed) => managed.complete_restart(fallback_default),
            None => Ok(()),
        }
    }

    async fn mark_degraded(&self, source: SourceKind) {
        if let Some(managed) = self.get(source) {
            managed.mark_degraded();
        }
    }
}

/// One capture-and-stream session.
///
/// `start` brings every enabled source up and connects its transport;
/// `stop` tears everything down and is idempotent. Device-change
/// notifications and reconfiguration arrive through this type as well.
pub struct CaptureSession {
    backends: SessionBackends,
    config: Mutex<SessionConfig>,
    events: broadcast::Sender<SessionEvent>,
    sources: Arc<SourceSet>,
    coordinator: Mutex<Option<Arc<DeviceChangeCoordinator>>>,
    transports: Mutex<BTreeMap<SourceKind, TransportSlot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Serializes start/stop/reconfigure against each other.
    lifecycle: tokio::sync::Mutex<()>,
}

impl CaptureSession {
    /// Validate the configuration, start every enabled source, and
    /// connect the transports.
    ///
    /// A source that fails to come up is logged and skipped as long as
    /// at least one source started; a fully failed start is an error. A
    /// transport that cannot connect yet is not an error, it keeps
    /// retrying in the background while audio buffers.
    pub async fn start(
        config: SessionConfig,
        backends: SessionBackends,
    ) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::Configuration)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let session = Self {
            backends,
            config: Mutex::new(config.clone()),
            events,
            sources: Arc::new(SourceSet::default()),
            coordinator: Mutex::new(None),
            transports: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        };
        session.build(&config).await?;
        Ok(session)
    }

    /// The unified upward event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Entry point for platform device watchers. Cheap and non-blocking;
    /// bursts coalesce inside the coordinator.
    pub fn notify_device_change(&self, source: SourceKind, reason: &str) {
        let coordinator = self.coordinator.lock().clone();
        match coordinator {
            Some(coordinator) => coordinator.request_restart(source, reason),
            None => log::debug!("{}: device change after stop, ignored", source),
        }
    }

    /// Ask the far end to flush pending transcription results without
    /// closing anything.
    pub async fn finalize(&self) {
        let slots: Vec<TransportSlot> = self.transports.lock().values().cloned().collect();
        for slot in slots {
            let transport = slot.lock().clone();
            if let Err(e) = transport.send_control(ControlKind::Finalize).await {
                log::warn!("finalize request failed: {}", e);
            }
        }
    }

    /// Apply a new configuration.
    ///
    /// When only transport-level settings changed (language, token,
    /// endpoint) capture keeps running and the transports are swapped in
    /// place. Otherwise the whole session restarts on the new settings.
    pub async fn reconfigure(&self, next: SessionConfig) -> Result<(), CaptureError> {
        next.validate().map_err(CaptureError::Configuration)?;
        let _guard = self.lifecycle.lock().await;

        let transport_only = self.config.lock().capture_eq(&next);
        if transport_only {
            log::info!("reconfiguring transports, capture keeps running");
            let slots: Vec<(SourceKind, TransportSlot)> = self
                .transports
                .lock()
                .iter()
                .map(|(kind, slot)| (*kind, slot.clone()))
                .collect();
            for (kind, slot) in slots {
                let transport = (self.backends.transport_factory)(kind, &next);
                let relay_task =
                    tokio::spawn(relay(kind, transport.subscribe(), self.events.clone()));
                let old = {
                    let mut current = slot.lock();
                    std::mem::replace(&mut *current, Arc::clone(&transport))
                };
                if let Err(e) = old.close().await {
                    log::warn!("{}: closing previous transport failed: {}", kind, e);
                }
                if let Err(e) = transport.connect().await {
                    log::warn!("{}: connect after reconfigure failed: {}", kind, e);
                    let _ = self.events.send(SessionEvent::TransportError {
                        source: kind,
                        message: e.to_string(),
                    });
                }
                self.tasks.lock().push(relay_task);
            }
        } else {
            log::info!("capture settings changed, restarting session");
            self.teardown().await;
            self.build(&next).await?;
        }

        *self.config.lock() = next;
        Ok(())
    }

    /// Stop capturing, shut the coordinator down, close every transport.
    /// Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
    }

    pub fn source_state(&self, kind: SourceKind) -> Option<SourceState> {
        self.sources.get(kind).map(|s| s.state())
    }

    pub fn transport_state(&self, kind: SourceKind) -> Option<TransportState> {
        self.transports
            .lock()
            .get(&kind)
            .map(|slot| slot.lock().state())
    }

    pub fn current_levels(&self, kind: SourceKind) -> Option<AudioLevels> {
        self.sources.get(kind).map(|s| s.current_levels())
    }

    pub fn diagnostics(&self, kind: SourceKind) -> Option<SourceDiagnostics> {
        self.sources.get(kind).map(|s| s.diagnostics())
    }

    /// Whether frame delivery is currently gated by a restart.
    pub fn is_paused(&self) -> bool {
        self.coordinator
            .lock()
            .as_ref()
            .map(|c| c.is_paused())
            .unwrap_or(false)
    }

    async fn build(&self, config: &SessionConfig) -> Result<(), CaptureError> {
        let coordinator = Arc::new(DeviceChangeCoordinator::new(
            CoordinatorConfig {
                debounce_window: config.debounce_window,
                settle_delay: config.settle_delay,
                ..CoordinatorConfig::default()
            },
            Arc::clone(&self.sources) as Arc<dyn RestartExecutor>,
        ));
        let pause_gate = coordinator.pause_gate();

        let mut kinds = Vec::new();
        if config.enable_mic {
            kinds.push(SourceKind::Mic);
        }
        if config.enable_system {
            kinds.push(SourceKind::System);
        }

        let mut started = 0usize;
        let mut first_error = None;

        for kind in kinds {
            let (factory, configured_device) = match kind {
                SourceKind::Mic => (
                    self.backends.mic_factory.clone(),
                    config.mic_device_id.clone(),
                ),
                SourceKind::System => (self.backends.system_factory.clone(), None),
            };

            let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
            let source = Arc::new(ManagedSource::new(
                kind,
                factory,
                Arc::clone(&self.backends.permissions),
                FormatConverter::new(config.target_sample_rate),
                config.warmup_frames,
                configured_device,
                Arc::clone(&pause_gate),
                frame_tx,
            ));
            source.set_first_frame_hook(coordinator.first_frame_hook());

            if let Err(e) = source.start() {
                log::error!("{}: capture failed to start: {}", kind, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
                continue;
            }
            started += 1;
            self.sources.insert(kind, Arc::clone(&source));

            let transport = (self.backends.transport_factory)(kind, config);
            let slot: TransportSlot = Arc::new(Mutex::new(Arc::clone(&transport)));

            // Subscribe before connecting so the Connected transition is
            // never missed.
            self.tasks.lock().push(tokio::spawn(relay(
                kind,
                transport.subscribe(),
                self.events.clone(),
            )));
            self.tasks.lock().push(tokio::spawn(pump(
                kind,
                frame_rx,
                Arc::clone(&slot),
                Arc::clone(&source),
                self.events.clone(),
            )));

            if let Err(e) = transport.connect().await {
                log::warn!("{}: initial connect failed: {}", kind, e);
                let _ = self.events.send(SessionEvent::TransportError {
                    source: kind,
                    message: e.to_string(),
                });
            }
            self.transports.lock().insert(kind, slot);
        }

        if started == 0 {
            coordinator.shutdown().await;
            return Err(first_error.unwrap_or(CaptureError::CaptureUnavailable));
        }

        *self.coordinator.lock() = Some(coordinator);
        Ok(())
    }

    async fn teardown(&self) {
        for source in self.sources.drain() {
            source.stop();
        }

        let coordinator = self.coordinator.lock().take();
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }

        let slots: Vec<TransportSlot> = {
            let mut transports = self.transports.lock();
            let drained = transports.values().cloned().collect();
            transports.clear();
            drained
        };
        for slot in slots {
            let transport = slot.lock().clone();
            if let Err(e) = transport.close().await {
                log::warn!("transport close failed: {}", e);
            }
        }

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }
}

/// Forward frames from one source into its transport slot, emitting an
/// occasional level reading.
async fn pump(
    kind: SourceKind,
    mut frame_rx: mpsc::Receiver<AudioFrame>,
    slot: TransportSlot,
    source: Arc<ManagedSource>,
    events: broadcast::Sender<SessionEvent>,
) {
    let mut since_levels = 0u32;
    while let Some(frame) = frame_rx.recv().await {
        let transport = slot.lock().clone();
        if let Err(e) = transport.send_pcm(frame).await {
            log::warn!("{}: frame not sent: {}", kind, e);
        }
        since_levels += 1;
        if since_levels >= LEVELS_INTERVAL_FRAMES {
            since_levels = 0;
            let _ = events.send(SessionEvent::Levels {
                source: kind,
                levels: source.current_levels(),
            });
        }
    }
    log::debug!("{}: frame pump ended", kind);
}

/// Map one transport's event stream onto the unified session stream.
async fn relay(
    kind: SourceKind,
    mut transport_rx: broadcast::Receiver<TransportEvent>,
    events: broadcast::Sender<SessionEvent>,
) {
    loop {
        match transport_rx.recv().await {
            Ok(TransportEvent::StateChanged(TransportState::Connected)) => {
                let _ = events.send(SessionEvent::SourceConnected(kind));
            }
            Ok(TransportEvent::StateChanged(TransportState::Disconnected)) => {
                let _ = events.send(SessionEvent::SourceDisconnected(kind));
            }
            Ok(TransportEvent::StateChanged(_)) => {}
            Ok(TransportEvent::Transcript(transcript)) => {
                let _ = events.send(SessionEvent::Transcript(transcript));
            }
            Ok(TransportEvent::Error(message)) => {
                let _ = events.send(SessionEvent::TransportError {
                    source: kind,
                    message,
                });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("{}: event relay lagged, {} event(s) skipped", kind, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
