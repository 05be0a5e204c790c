//! System-audio capture provider backed by cpal.
//!
//! Uses WASAPI loopback on a render endpoint on Windows and monitor
//! sources elsewhere. Where neither exists, `start` fails with
//! `CaptureUnavailable` and the session continues mic-only.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use audio_stream_core::models::audio::{DeviceDirection, DeviceIdentity};
use audio_stream_core::models::error::CaptureError;
use audio_stream_core::traits::capture_provider::{CaptureProvider, NativeBufferCallback};

use crate::worker::{run_capture, Command, Endpoint};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Capture provider for the system-output mix.
pub struct CpalLoopbackCapture {
    device_id: Option<String>,
    command_tx: Mutex<Option<mpsc::Sender<Command>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    opened: Mutex<Option<DeviceIdentity>>,
}

impl CpalLoopbackCapture {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            device_id,
            command_tx: Mutex::new(None),
            handle: Mutex::new(None),
            opened: Mutex::new(None),
        }
    }
}

impl CaptureProvider for CpalLoopbackCapture {
    fn is_available(&self) -> bool {
        crate::worker::endpoint_available(Endpoint::Loopback, self.device_id.as_deref())
    }

    fn start(&mut self, callback: NativeBufferCallback) -> Result<(), CaptureError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let device_id = self.device_id.clone();

        let handle = thread::Builder::new()
            .name("cpal-loopback-capture".into())
            .spawn(move || {
                run_capture(Endpoint::Loopback, device_id, callback, command_rx, ready_tx);
            })
            .map_err(|e| CaptureError::FormatNegotiation(format!("capture thread: {}", e)))?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(identity)) => {
                *self.opened.lock() = Some(identity);
                *self.command_tx.lock() = Some(command_tx);
                *self.handle.lock() = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                drop(command_tx);
                let _ = handle.join();
                Err(CaptureError::FormatNegotiation(
                    "capture stream did not start in time".into(),
                ))
            }
        }
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(tx) = self.command_tx.lock().take() {
            let _ = tx.send(Command::Stop);
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn device_info(&self) -> DeviceIdentity {
        if let Some(identity) = self.opened.lock().clone() {
            return identity;
        }
        let name = self
            .device_id
            .clone()
            .unwrap_or_else(|| "system output".into());
        DeviceIdentity {
            id: name.clone(),
            display_name: name,
            direction: DeviceDirection::Output,
            is_default: self.device_id.is_none(),
        }
    }
}

impl Drop for CpalLoopbackCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
