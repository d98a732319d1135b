//! Capture device selection.
//!
//! `auto` enumerates fresh on every call and picks the best recognized
//! USB interface. A named device must show up in a successful enumeration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::{Device, DeviceEnumerator};
use crate::error::CaptureError;

/// Operator's device choice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DeviceSelector {
    Auto,
    Named(String),
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Named(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Device name cannot be empty".to_string());
        }
        if s.eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            Ok(Self::Named(s.to_string()))
        }
    }
}

impl From<DeviceSelector> for String {
    fn from(selector: DeviceSelector) -> Self {
        selector.to_string()
    }
}

impl TryFrom<String> for DeviceSelector {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Preference score; None means never pick automatically
fn score(device: &Device) -> Option<u8> {
    let name = device.name.to_lowercase();
    if name.contains("bcm2835") || name.contains("hdmi") {
        return None;
    }
    if name.contains("behringer") || name.contains("uca202") || name.contains("uca222") {
        return Some(3);
    }
    if name.contains("usb audio codec") {
        return Some(2);
    }
    if device.has_capability("usb") || name.contains("usb") {
        return Some(1);
    }
    Some(0)
}

/// Best automatic choice, ties broken by lowest card index
pub fn pick_device(devices: &[Device]) -> Option<&Device> {
    devices
        .iter()
        .filter_map(|d| score(d).map(|s| (s, d)))
        .max_by(|(sa, a), (sb, b)| sa.cmp(sb).then(b.index.cmp(&a.index)))
        .map(|(_, d)| d)
}

/// `plughw:1,0` and `hw:1` name the same card
fn normalize(name: &str) -> String {
    let name = name.trim();
    let name = name.strip_prefix("plug").unwrap_or(name);
    name.strip_suffix(",0").unwrap_or(name).to_string()
}

/// Resolve a selector to an ALSA device identifier
pub async fn resolve_device(
    enumerator: &dyn DeviceEnumerator,
    selector: &DeviceSelector,
    fallback: &str,
) -> Result<String, CaptureError> {
    match selector {
        DeviceSelector::Auto => match enumerator.list_devices().await {
            Ok(devices) => match pick_device(&devices) {
                Some(device) => {
                    debug!(device = %device.device, name = %device.name, "Auto-selected capture device");
                    Ok(device.device.clone())
                }
                None => {
                    warn!(fallback, "No recognized capture device, using fallback");
                    Ok(fallback.to_string())
                }
            },
            Err(e) => {
                warn!(fallback, error = %e, "Device enumeration failed, using fallback");
                Ok(fallback.to_string())
            }
        },
        DeviceSelector::Named(name) => {
            let devices = enumerator
                .list_devices()
                .await
                .map_err(|e| CaptureError::Device(format!("cannot list capture devices: {:#}", e)))?;
            let wanted = normalize(name);
            if devices.iter().any(|d| normalize(&d.device) == wanted) {
                Ok(name.clone())
            } else {
                Err(CaptureError::Device(format!("device {} not found", name)))
            }
        }
    }
}
