use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::models::audio::{AudioFrame, AudioLevels, SourceDiagnostics, SourceKind};
use crate::models::error::CaptureError;
use crate::models::state::SourceState;
use crate::processing::converter::FormatConverter;
use crate::traits::capture_provider::{CaptureProvider, NativeBufferCallback, ProviderFactory};
use crate::traits::permissions::PermissionProbe;

/// Hook fired once per (re)start on the first post-warm-up frame. The
/// coordinator uses it to release its pause gate.
pub type FirstFrameHook = Arc<dyn Fn(SourceKind) + Send + Sync + 'static>;

/// Shared pieces the audio callback works against. The callback does
/// bounded-cost convert + hand-off only; everything else lives on the
/// owner's side.
struct CallbackShared {
    kind: SourceKind,
    converter: FormatConverter,
    warmup_remaining: AtomicU32,
    awaiting_first_frame: AtomicBool,
    pause_gate: Arc<AtomicBool>,
    diagnostics: Mutex<SourceDiagnostics>,
    levels: Mutex<AudioLevels>,
    first_frame_hook: Mutex<Option<FirstFrameHook>>,
}

/// Owns one logical capture source: a platform provider recreated on
/// every (re)start, warm-up discarding, canonical conversion inside the
/// audio callback, and non-blocking hand-off into a bounded channel.
pub struct ManagedSource {
    kind: SourceKind,
    factory: ProviderFactory,
    permissions: Arc<dyn PermissionProbe>,
    warmup_frames: u32,
    configured_device: Option<String>,
    state: Mutex<SourceState>,
    provider: Mutex<Option<Box<dyn CaptureProvider>>>,
    frame_tx: mpsc::Sender<AudioFrame>,
    shared: Arc<CallbackShared>,
}

impl ManagedSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: SourceKind,
        factory: ProviderFactory,
        permissions: Arc<dyn PermissionProbe>,
        converter: FormatConverter,
        warmup_frames: u32,
        configured_device: Option<String>,
        pause_gate: Arc<AtomicBool>,
        frame_tx: mpsc::Sender<AudioFrame>,
    ) -> Self {
        Self {
            kind,
            factory,
            permissions,
            warmup_frames,
            configured_device,
            state: Mutex::new(SourceState::Stopped),
            provider: Mutex::new(None),
            frame_tx,
            shared: Arc::new(CallbackShared {
                kind,
                converter,
                warmup_remaining: AtomicU32::new(0),
                awaiting_first_frame: AtomicBool::new(false),
                pause_gate,
                diagnostics: Mutex::new(SourceDiagnostics::default()),
                levels: Mutex::new(AudioLevels::default()),
                first_frame_hook: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    pub fn current_levels(&self) -> AudioLevels {
        *self.shared.levels.lock()
    }

    pub fn diagnostics(&self) -> SourceDiagnostics {
        self.shared.diagnostics.lock().clone()
    }

    /// Install the resume hook consulted on the first valid frame after
    /// each (re)start.
    pub fn set_first_frame_hook(&self, hook: FirstFrameHook) {
        *self.shared.first_frame_hook.lock() = Some(hook);
    }

    /// Start capturing. Idempotent while already running.
    pub fn start(&self) -> Result<(), CaptureError> {
        {
            let state = self.state.lock();
            if state.is_running() || matches!(*state, SourceState::Starting) {
                return Ok(());
            }
        }

        if !self.permissions.has_capture_permission(self.kind)
            && !self.permissions.request_capture_permission(self.kind)
        {
            log::error!("{}: capture permission denied", self.kind);
            return Err(CaptureError::PermissionDenied);
        }

        self.set_state(SourceState::Starting);
        match self.open_provider(self.configured_device.as_deref()) {
            Ok(()) => {
                self.set_state(SourceState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(SourceState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop capturing and release the device handle synchronously.
    /// Idempotent; safe to call from any state.
    pub fn stop(&self) {
        self.release_provider();
        self.set_state(SourceState::Stopped);
    }

    /// First half of a coordinated restart: tear the provider down and
    /// enter Restarting. The coordinator owns the settle delay between
    /// this and `complete_restart`.
    pub fn begin_restart(&self) {
        self.release_provider();
        self.set_state(SourceState::Restarting);
    }

    /// Second half of a coordinated restart: build a fresh provider.
    ///
    /// With `fallback_default` the configured device id is ignored and
    /// the platform default endpoint is opened instead; the source then
    /// runs Degraded.
    pub fn complete_restart(&self, fallback_default: bool) -> Result<(), CaptureError> {
        let device = if fallback_default {
            None
        } else {
            self.configured_device.as_deref()
        };
        match self.open_provider(device) {
            Ok(()) => {
                let next = if fallback_default {
                    SourceState::Degraded
                } else {
                    SourceState::Running
                };
                self.set_state(next);
                Ok(())
            }
            Err(e) => {
                // Stay in Restarting so the coordinator can retry.
                self.release_provider();
                Err(e)
            }
        }
    }

    /// Mark the source Degraded without touching the provider, used when
    /// even the default device could not be recovered but the session
    /// should continue.
    pub fn mark_degraded(&self) {
        self.set_state(SourceState::Degraded);
    }

    fn open_provider(&self, device_id: Option<&str>) -> Result<(), CaptureError> {
        let mut provider = (self.factory)(device_id)?;
        if !provider.is_available() {
            return Err(CaptureError::CaptureUnavailable);
        }

        self.shared
            .warmup_remaining
            .store(self.warmup_frames, Ordering::SeqCst);
        self.shared
            .awaiting_first_frame
            .store(true, Ordering::SeqCst);

        provider.start(self.native_callback())?;
        log::info!(
            "{}: capture started on '{}'",
            self.kind,
            provider.device_info().display_name
        );
        *self.provider.lock() = Some(provider);
        Ok(())
    }

    fn release_provider(&self) {
        if let Some(mut provider) = self.provider.lock().take() {
            if let Err(e) = provider.stop() {
                log::warn!("{}: provider stop failed: {}", self.kind, e);
            }
        }
    }

    /// Build the audio-thread callback: warm-up discard, downmix,
    /// resample, quantize, level metering, pause gate, `try_send`.
    fn native_callback(&self) -> NativeBufferCallback {
        let shared = Arc::clone(&self.shared);
        let frame_tx = self.frame_tx.clone();

        Arc::new(move |samples: &[f32], sample_rate: u32, channels: u16| {
            shared.diagnostics.lock().callback_count += 1;

            if shared.warmup_remaining.load(Ordering::SeqCst) > 0 {
                shared.warmup_remaining.fetch_sub(1, Ordering::SeqCst);
                shared.diagnostics.lock().warmup_discards += 1;
                return;
            }

            let mono = FormatConverter::downmix_to_mono(samples, channels);
            {
                let mut levels = shared.levels.lock();
                levels.rms = FormatConverter::rms_level(&mono);
                levels.peak = FormatConverter::peak_level(&mono);
            }

            let resampled = shared.converter.resample(&mono, sample_rate);
            if resampled.is_empty() {
                return;
            }
            let pcm = FormatConverter::quantize_i16_le(&resampled);

            if shared.awaiting_first_frame.swap(false, Ordering::SeqCst) {
                if let Some(hook) = shared.first_frame_hook.lock().clone() {
                    hook(shared.kind);
                }
            }

            if shared.pause_gate.load(Ordering::SeqCst) {
                shared.diagnostics.lock().paused_discards += 1;
                return;
            }

            let frame = AudioFrame {
                source: shared.kind,
                pcm: Bytes::from(pcm),
                sample_rate: shared.converter.target_sample_rate(),
                channels: 1,
                captured_at: Instant::now(),
            };

            let mut diagnostics = shared.diagnostics.lock();
            match frame_tx.try_send(frame) {
                Ok(()) => diagnostics.frames_forwarded += 1,
                Err(_) => diagnostics.frames_dropped += 1,
            }
        })
    }

    fn set_state(&self, next: SourceState) {
        let mut state = self.state.lock();
        if *state != next {
            log::debug!("{}: {:?} -> {:?}", self.kind, *state, next);
            *state = next;
        }
    }
}

impl Drop for ManagedSource {
    fn drop(&mut self) {
        self.release_provider();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio::{DeviceDirection, DeviceIdentity};
    use std::sync::atomic::AtomicUsize;

    /// Provider whose buffers are pushed by the test itself.
    struct ScriptedProvider {
        callback: Arc<Mutex<Option<NativeBufferCallback>>>,
        available: bool,
        device: DeviceIdentity,
        stops: Arc<AtomicUsize>,
    }

    impl CaptureProvider for ScriptedProvider {
        fn is_available(&self) -> bool {
            self.available
        }

        fn start(&mut self, callback: NativeBufferCallback) -> Result<(), CaptureError> {
            *self.callback.lock() = Some(callback);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), CaptureError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *self.callback.lock() = None;
            Ok(())
        }

        fn device_info(&self) -> DeviceIdentity {
            self.device.clone()
        }
    }

    struct Bench {
        source: ManagedSource,
        callback: Arc<Mutex<Option<NativeBufferCallback>>>,
        frame_rx: mpsc::Receiver<AudioFrame>,
        pause_gate: Arc<AtomicBool>,
        stops: Arc<AtomicUsize>,
    }

    fn bench(warmup: u32) -> Bench {
        let callback: Arc<Mutex<Option<NativeBufferCallback>>> = Arc::new(Mutex::new(None));
        let stops = Arc::new(AtomicUsize::new(0));
        let pause_gate = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::channel(64);

        let cb = Arc::clone(&callback);
        let stop_count = Arc::clone(&stops);
        let factory: ProviderFactory = Arc::new(move |device_id: Option<&str>| {
            let name = device_id.unwrap_or("default").to_string();
            Ok(Box::new(ScriptedProvider {
                callback: Arc::clone(&cb),
                available: true,
                device: DeviceIdentity {
                    id: name.clone(),
                    display_name: name,
                    direction: DeviceDirection::Input,
                    is_default: device_id.is_none(),
                },
                stops: Arc::clone(&stop_count),
            }) as Box<dyn CaptureProvider>)
        });

        let source = ManagedSource::new(
            SourceKind::Mic,
            factory,
            Arc::new(crate::traits::permissions::AlwaysAllowed),
            FormatConverter::new(16000),
            warmup,
            Some("usb-mic".into()),
            Arc::clone(&pause_gate),
            frame_tx,
        );

        Bench {
            source,
            callback,
            frame_rx,
            pause_gate,
            stops,
        }
    }

    fn push_buffer(bench: &Bench, samples: &[f32]) {
        let cb = bench.callback.lock().clone().expect("capture not started");
        cb(samples, 16000, 1);
    }

    #[test]
    fn warmup_frames_are_discarded() {
        let mut bench = bench(3);
        bench.source.start().unwrap();

        for _ in 0..5 {
            push_buffer(&bench, &[0.5f32; 160]);
        }

        let mut delivered = 0;
        while bench.frame_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 2);
        assert_eq!(bench.source.diagnostics().warmup_discards, 3);
    }

    #[test]
    fn start_is_idempotent() {
        let bench = bench(0);
        bench.source.start().unwrap();
        bench.source.start().unwrap();
        assert_eq!(bench.source.state(), SourceState::Running);
        assert_eq!(bench.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_is_idempotent_and_releases() {
        let bench = bench(0);
        bench.source.start().unwrap();
        bench.source.stop();
        bench.source.stop();
        assert_eq!(bench.source.state(), SourceState::Stopped);
        assert_eq!(bench.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pause_gate_blocks_frames() {
        let mut bench = bench(0);
        bench.source.start().unwrap();
        bench.pause_gate.store(true, Ordering::SeqCst);

        push_buffer(&bench, &[0.5f32; 160]);
        assert!(bench.frame_rx.try_recv().is_err());
        assert_eq!(bench.source.diagnostics().paused_discards, 1);

        bench.pause_gate.store(false, Ordering::SeqCst);
        push_buffer(&bench, &[0.5f32; 160]);
        assert!(bench.frame_rx.try_recv().is_ok());
    }

    #[test]
    fn first_frame_hook_fires_after_warmup() {
        let bench = bench(2);
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&fired);
        bench
            .source
            .set_first_frame_hook(Arc::new(move |_| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            }));
        bench.source.start().unwrap();

        push_buffer(&bench, &[0.1f32; 160]);
        push_buffer(&bench, &[0.1f32; 160]);
        assert_eq!(fired.load(Ordering::SeqCst), 0); // still warming up

        push_buffer(&bench, &[0.1f32; 160]);
        push_buffer(&bench, &[0.1f32; 160]);
        assert_eq!(fired.load(Ordering::SeqCst), 1); // once per start
    }

    #[test]
    fn restart_replaces_provider_and_rearms_warmup() {
        let mut bench = bench(1);
        bench.source.start().unwrap();
        push_buffer(&bench, &[0.1f32; 160]); // warm-up
        push_buffer(&bench, &[0.1f32; 160]);
        assert!(bench.frame_rx.try_recv().is_ok());

        bench.source.begin_restart();
        assert_eq!(bench.source.state(), SourceState::Restarting);
        assert_eq!(bench.stops.load(Ordering::SeqCst), 1);

        bench.source.complete_restart(false).unwrap();
        assert_eq!(bench.source.state(), SourceState::Running);

        push_buffer(&bench, &[0.1f32; 160]); // new warm-up applies
        assert!(bench.frame_rx.try_recv().is_err());
        push_buffer(&bench, &[0.1f32; 160]);
        assert!(bench.frame_rx.try_recv().is_ok());
    }

    #[test]
    fn fallback_restart_runs_degraded() {
        let bench = bench(0);
        bench.source.start().unwrap();
        bench.source.begin_restart();
        bench.source.complete_restart(true).unwrap();
        assert_eq!(bench.source.state(), SourceState::Degraded);
        assert!(bench.source.state().delivers_frames());
    }

    #[test]
    fn frames_convert_to_canonical_pcm() {
        let mut bench = bench(0);
        bench.source.start().unwrap();

        // 10 ms of 48 kHz stereo should arrive as 10 ms of 16 kHz mono.
        let stereo: Vec<f32> = vec![0.25; 480 * 2];
        let cb = bench.callback.lock().clone().unwrap();
        cb(&stereo, 48000, 2);

        let frame = bench.frame_rx.try_recv().unwrap();
        assert_eq!(frame.sample_rate, 16000);
        assert_eq!(frame.channels, 1);
        assert_eq!(frame.pcm.len() / 2, 160);
    }
}
