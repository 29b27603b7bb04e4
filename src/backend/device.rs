//! Device enumeration and lookup
//!
//! Devices are addressed by `input:NAME` / `output:NAME` ids so an id
//! survives devices being added or removed, unlike positional indices.
//! A bare name is accepted wherever the direction is already known.

use cpal::traits::{DeviceTrait, HostTrait};
use tracing::warn;

use crate::error::BackendError;

/// One enumerated device and what it supports.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    /// Common sample rates the device accepts.
    pub sample_rates: Vec<u32>,
    /// Channel counts the device accepts.
    pub channels: Vec<u16>,
}

/// Lists every capture and playback device of `host`. A device that does
/// both appears once, flagged for both directions.
pub fn list_devices(host: &cpal::Host) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(inputs) => {
            for device in inputs {
                let Ok(name) = device.name() else { continue };
                let (sample_rates, channels) = probe_capabilities(&device, true);
                devices.push(DeviceInfo {
                    id: format!("input:{name}"),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
        Err(e) => warn!(error = %e, "input device enumeration failed"),
    }

    match host.output_devices() {
        Ok(outputs) => {
            for device in outputs {
                let Ok(name) = device.name() else { continue };
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }
                let (sample_rates, channels) = probe_capabilities(&device, false);
                devices.push(DeviceInfo {
                    id: format!("output:{name}"),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
        Err(e) => warn!(error = %e, "output device enumeration failed"),
    }

    devices
}

fn probe_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    fn collect(
        configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    ) -> (Vec<u32>, Vec<u16>) {
        let mut rates = Vec::new();
        let mut channels = Vec::new();
        for config in configs {
            for rate in [44_100u32, 48_000, 88_200, 96_000, 176_400, 192_000] {
                let rate_in_range = cpal::SampleRate(rate) >= config.min_sample_rate()
                    && cpal::SampleRate(rate) <= config.max_sample_rate();
                if rate_in_range && !rates.contains(&rate) {
                    rates.push(rate);
                }
            }
            if !channels.contains(&config.channels()) {
                channels.push(config.channels());
            }
        }
        rates.sort_unstable();
        channels.sort_unstable();
        (rates, channels)
    }

    if is_input {
        device
            .supported_input_configs()
            .map(collect)
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(collect)
            .unwrap_or_default()
    }
}

/// Strips a direction prefix off a device id.
fn device_name_of(id: &str) -> &str {
    id.strip_prefix("input:")
        .or_else(|| id.strip_prefix("output:"))
        .unwrap_or(id)
}

/// Resolves a capture device: by id when given, the host default
/// otherwise.
pub fn find_input_device(
    host: &cpal::Host,
    id: Option<&str>,
) -> Result<cpal::Device, BackendError> {
    match id {
        None => host
            .default_input_device()
            .ok_or_else(|| BackendError::DeviceNotFound("no default input device".into())),
        Some(id) => {
            let name = device_name_of(id);
            host.input_devices()
                .map_err(|e| BackendError::DeviceNotFound(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| BackendError::DeviceNotFound(id.to_string()))
        }
    }
}

/// Resolves a playback device: by id when given, the host default
/// otherwise.
pub fn find_output_device(
    host: &cpal::Host,
    id: Option<&str>,
) -> Result<cpal::Device, BackendError> {
    match id {
        None => host
            .default_output_device()
            .ok_or_else(|| BackendError::DeviceNotFound("no default output device".into())),
        Some(id) => {
            let name = device_name_of(id);
            host.output_devices()
                .map_err(|e| BackendError::DeviceNotFound(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| BackendError::DeviceNotFound(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_prefixes_are_optional() {
        assert_eq!(device_name_of("input:USB Microphone"), "USB Microphone");
        assert_eq!(device_name_of("output:Speakers"), "Speakers");
        assert_eq!(device_name_of("Speakers"), "Speakers");
        // only the first prefix is structural
        assert_eq!(device_name_of("input:output:odd"), "output:odd");
    }

    #[test]
    fn listing_never_panics() {
        // machines without audio hardware report an empty list
        let _ = list_devices(&cpal::default_host());
    }

    #[test]
    fn unknown_device_id_is_an_error() {
        let host = cpal::default_host();
        let err = find_input_device(&host, Some("input:definitely-not-a-real-device-name"));
        assert!(matches!(err, Err(BackendError::DeviceNotFound(_))));
    }
}
