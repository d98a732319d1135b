//! ALSA capture device enumeration via `arecord -l`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::{Device, DeviceEnumerator};

/// Lists capture devices by running `arecord -l`
#[derive(Debug, Clone)]
pub struct ArecordEnumerator {
    binary_path: String,
}

impl Default for ArecordEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArecordEnumerator {
    pub fn new() -> Self {
        Self {
            binary_path: "arecord".to_string(),
        }
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl DeviceEnumerator for ArecordEnumerator {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let output = Command::new(&self.binary_path)
            .arg("-l")
            .output()
            .await
            .with_context(|| format!("Failed to run {} -l", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} -l failed with exit code {}: {}",
                self.binary_path,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(parse_arecord_list(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `arecord -l` output.
///
/// Lines look like
/// `card 1: CODEC [USB Audio CODEC], device 0: USB Audio [USB Audio]`;
/// everything else (headers, subdevice lines) is ignored.
pub fn parse_arecord_list(text: &str) -> Vec<Device> {
    text.lines().filter_map(parse_card_line).collect()
}

fn parse_card_line(line: &str) -> Option<Device> {
    let rest = line.trim().strip_prefix("card ")?;
    let (card, rest) = rest.split_once(':')?;
    let index: u32 = card.trim().parse().ok()?;

    let (card_part, device_part) = rest.split_once(", device ")?;
    let (device_num, device_desc) = device_part.split_once(':')?;
    let device_num: u32 = device_num.trim().parse().ok()?;

    let name = bracketed(card_part).unwrap_or_else(|| card_part.trim().to_string());
    let short_name = card_part
        .split('[')
        .next()
        .map(str::trim)
        .unwrap_or_default();

    let mut capabilities = vec!["capture".to_string()];
    let haystack = format!("{} {} {}", short_name, name, device_desc).to_lowercase();
    if haystack.contains("usb") {
        capabilities.push("usb".to_string());
    }

    let device = if device_num == 0 {
        format!("hw:{}", index)
    } else {
        format!("hw:{},{}", index, device_num)
    };

    Some(Device {
        index,
        device,
        name,
        capabilities,
    })
}

fn bracketed(text: &str) -> Option<String> {
    let start = text.find('[')?;
    let end = text[start..].find(']')? + start;
    Some(text[start + 1..end].trim().to_string())
}
