//! Polling device-topology watcher.
//!
//! cpal has no change notifications, so the watcher snapshots the
//! device lists on an interval and reports differences to a
//! `DeviceChangeListener`. Consecutive differences within one swap are
//! fine to report individually; the coordinator debounces them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use audio_stream_core::models::audio::SourceKind;
use audio_stream_core::traits::capture_provider::DeviceChangeListener;

use crate::devices::DeviceCatalog;

/// One observation of the audio device topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TopologySnapshot {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

impl TopologySnapshot {
    fn capture() -> Self {
        let mut inputs: Vec<String> = DeviceCatalog::input_devices()
            .into_iter()
            .map(|d| d.id)
            .collect();
        inputs.sort();
        let mut outputs: Vec<String> = DeviceCatalog::output_devices()
            .into_iter()
            .map(|d| d.id)
            .collect();
        outputs.sort();
        Self {
            inputs,
            outputs,
            default_input: DeviceCatalog::default_input_id(),
            default_output: DeviceCatalog::default_output_id(),
        }
    }

    /// Differences from `self` to `next`, as (affected source, reason).
    pub(crate) fn changes(&self, next: &Self) -> Vec<(SourceKind, String)> {
        let mut changes = Vec::new();
        if self.default_input != next.default_input {
            changes.push((SourceKind::Mic, "default input changed".to_string()));
        } else if self.inputs != next.inputs {
            changes.push((SourceKind::Mic, "input devices changed".to_string()));
        }
        if self.default_output != next.default_output {
            changes.push((SourceKind::System, "default output changed".to_string()));
        } else if self.outputs != next.outputs {
            changes.push((SourceKind::System, "output devices changed".to_string()));
        }
        changes
    }
}

/// Background thread that polls the topology and notifies on change.
pub struct DeviceWatcher {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeviceWatcher {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

    pub fn start(poll_interval: Duration, listener: DeviceChangeListener) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("device-watcher".into())
            .spawn(move || {
                let mut current = TopologySnapshot::capture();
                while thread_running.load(Ordering::SeqCst) {
                    thread::sleep(poll_interval);
                    if !thread_running.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = TopologySnapshot::capture();
                    for (source, reason) in current.changes(&next) {
                        log::info!("{}: {}", source, reason);
                        listener(source, &reason);
                    }
                    current = next;
                }
            })
            .ok();

        Self {
            running,
            handle: Mutex::new(handle),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
