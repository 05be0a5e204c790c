//! Capture thread shared by the mic and loopback providers.
//!
//! cpal streams are not `Send`, so each provider runs one dedicated
//! thread that opens the device, owns the stream, and waits for a stop
//! command. Startup success or failure is reported back through a
//! one-shot ready channel before the wait loop begins.

use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, SupportedStreamConfig};

use audio_stream_core::models::audio::{DeviceDirection, DeviceIdentity};
use audio_stream_core::models::error::CaptureError;
use audio_stream_core::traits::capture_provider::NativeBufferCallback;

pub(crate) enum Command {
    Stop,
}

/// Which kind of endpoint to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    /// A regular capture device (microphone).
    Input,
    /// System audio: a WASAPI render endpoint on Windows, a monitor
    /// source elsewhere.
    Loopback,
}

pub(crate) type Ready = Result<DeviceIdentity, CaptureError>;

/// Thread body: resolve the device, build and play the stream, then
/// block on the command channel until told to stop.
pub(crate) fn run_capture(
    endpoint: Endpoint,
    device_id: Option<String>,
    callback: NativeBufferCallback,
    command_rx: mpsc::Receiver<Command>,
    ready_tx: mpsc::Sender<Ready>,
) {
    let (device, config, identity) = match resolve(endpoint, device_id.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let stream = match build_stream(&device, &config, callback) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::FormatNegotiation(e.to_string())));
        return;
    }

    log::info!(
        "capture stream opened on '{}' ({} Hz, {} ch)",
        identity.display_name,
        config.sample_rate().0,
        config.channels()
    );
    let _ = ready_tx.send(Ok(identity));

    loop {
        match command_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Command::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }
    // Stream drops here, on the thread that created it.
}

/// Whether the endpoint could be opened right now.
pub(crate) fn endpoint_available(endpoint: Endpoint, device_id: Option<&str>) -> bool {
    resolve(endpoint, device_id).is_ok()
}

fn resolve(
    endpoint: Endpoint,
    device_id: Option<&str>,
) -> Result<(Device, SupportedStreamConfig, DeviceIdentity), CaptureError> {
    let host = cpal::default_host();
    match endpoint {
        Endpoint::Input => {
            let device = find_input_device(&host, device_id).ok_or(CaptureError::CaptureUnavailable)?;
            let config = device
                .default_input_config()
                .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?;
            let name = device.name().unwrap_or_else(|_| "unknown input".into());
            let identity = DeviceIdentity {
                id: name.clone(),
                display_name: name,
                direction: DeviceDirection::Input,
                is_default: device_id.is_none(),
            };
            Ok((device, config, identity))
        }
        Endpoint::Loopback => resolve_loopback(&host, device_id),
    }
}

fn find_input_device(host: &cpal::Host, device_id: Option<&str>) -> Option<Device> {
    match device_id {
        Some(id) => host
            .input_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false)),
        None => host.default_input_device(),
    }
}

/// System-audio endpoint resolution.
///
/// On Windows WASAPI any render endpoint can be captured in loopback
/// mode, so the default output device is opened directly. Elsewhere the
/// platform exposes system audio as monitor sources among the regular
/// input devices (PulseAudio/PipeWire), so those are searched instead.
fn resolve_loopback(
    host: &cpal::Host,
    device_id: Option<&str>,
) -> Result<(Device, SupportedStreamConfig, DeviceIdentity), CaptureError> {
    // A pinned id names a monitor source, which shows up among the
    // regular input devices.
    if let Some(id) = device_id {
        if let Some(device) = find_input_device(host, Some(id)) {
            if let Ok(config) = device.default_input_config() {
                let name = device.name().unwrap_or_else(|_| "unknown monitor".into());
                let identity = DeviceIdentity {
                    id: name.clone(),
                    display_name: name,
                    direction: DeviceDirection::Output,
                    is_default: false,
                };
                return Ok((device, config, identity));
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let device = host
            .default_output_device()
            .ok_or(CaptureError::CaptureUnavailable)?;
        let config = device
            .default_output_config()
            .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?;
        let name = device.name().unwrap_or_else(|_| "unknown output".into());
        let identity = DeviceIdentity {
            id: name.clone(),
            display_name: name,
            direction: DeviceDirection::Output,
            is_default: true,
        };
        return Ok((device, config, identity));
    }

    #[cfg(not(target_os = "windows"))]
    {
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?;
        for device in devices {
            let name = match device.name() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !name.to_lowercase().contains("monitor") {
                continue;
            }
            let config = device
                .default_input_config()
                .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?;
            let identity = DeviceIdentity {
                id: name.clone(),
                display_name: name,
                direction: DeviceDirection::Output,
                is_default: true,
            };
            return Ok((device, config, identity));
        }
        Err(CaptureError::CaptureUnavailable)
    }
}

/// Build an input stream in the device's native format, converting to
/// f32 where the hardware delivers integers.
fn build_stream(
    device: &Device,
    config: &SupportedStreamConfig,
    callback: NativeBufferCallback,
) -> Result<Stream, CaptureError> {
    let sample_rate = config.sample_rate().0;
    let channels = config.channels();
    let stream_config: cpal::StreamConfig = config.clone().into();
    let err_fn = |e: cpal::StreamError| log::error!("capture stream error: {}", e);

    let stream = match config.sample_format() {
        SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    callback(data, sample_rate, channels);
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?,
        SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> =
                        data.iter().map(|s| f32::from(*s) / 32768.0).collect();
                    callback(&converted, sample_rate, channels);
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?,
        SampleFormat::U16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> = data
                        .iter()
                        .map(|s| (f32::from(*s) - 32768.0) / 32768.0)
                        .collect();
                    callback(&converted, sample_rate, channels);
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::FormatNegotiation(e.to_string()))?,
        other => {
            return Err(CaptureError::FormatNegotiation(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };
    Ok(stream)
}
