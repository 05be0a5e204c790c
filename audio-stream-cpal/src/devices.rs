//! Audio device enumeration via cpal.
//!
//! cpal identifies devices by name, so names double as ids here.

use cpal::traits::{DeviceTrait, HostTrait};

use audio_stream_core::models::audio::{DeviceDirection, DeviceIdentity};

pub struct DeviceCatalog;

impl DeviceCatalog {
    /// List capture (microphone) endpoints.
    pub fn input_devices() -> Vec<DeviceIdentity> {
        let host = cpal::default_host();
        let default_name = Self::default_input_id();
        let Ok(devices) = host.input_devices() else {
            return Vec::new();
        };
        devices
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceIdentity {
                id: name.clone(),
                display_name: name.clone(),
                direction: DeviceDirection::Input,
                is_default: Some(&name) == default_name.as_ref(),
            })
            .collect()
    }

    /// List render (output) endpoints.
    pub fn output_devices() -> Vec<DeviceIdentity> {
        let host = cpal::default_host();
        let default_name = Self::default_output_id();
        let Ok(devices) = host.output_devices() else {
            return Vec::new();
        };
        devices
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceIdentity {
                id: name.clone(),
                display_name: name.clone(),
                direction: DeviceDirection::Output,
                is_default: Some(&name) == default_name.as_ref(),
            })
            .collect()
    }

    pub fn default_input_id() -> Option<String> {
        cpal::default_host().default_input_device()?.name().ok()
    }

    pub fn default_output_id() -> Option<String> {
        cpal::default_host().default_output_device()?.name().ok()
    }
}
