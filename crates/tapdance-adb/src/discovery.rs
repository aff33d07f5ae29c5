//! Device discovery via `adb devices -l`.

use serde::{Deserialize, Serialize};

use crate::{AdbBridge, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSource {
    /// Emulator running on this host (`emulator-<port>` serial).
    Local,
    /// Remote device farm endpoint (`host:port` serial).
    Farm,
    /// USB-attached physical device.
    Physical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub platform: Platform,
    pub running: bool,
    pub source: DeviceSource,
    pub model: Option<String>,
}

/// List connected devices and emulators.
pub async fn discover_devices(bridge: &AdbBridge) -> Result<Vec<Device>> {
    let out = bridge.run_raw(&["devices", "-l"]).await?;
    Ok(parse_devices_output(&out.stdout))
}

impl AdbBridge {
    /// `adb` invocation without a serial, for discovery-level commands.
    pub async fn run_raw(&self, args: &[&str]) -> Result<crate::CommandOutput> {
        self.run(args).await
    }
}

/// Parse `adb devices -l` output. Lines look like:
///
/// ```text
/// emulator-5554          device product:sdk_gphone64 model:Pixel_7 device:emu64a
/// 192.168.1.20:5555      device model:SM_G991B
/// R5CT30XXXXX            offline usb:1-4
/// ```
pub fn parse_devices_output(stdout: &str) -> Vec<Device> {
    stdout
        .lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(parse_device_line)
        .collect()
}

fn parse_device_line(line: &str) -> Option<Device> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut parts = line.split_whitespace();
    let serial = parts.next()?;
    let state = parts.next()?;
    let model = parts
        .clone()
        .find_map(|p| p.strip_prefix("model:"))
        .map(|m| m.replace('_', " "));

    let source = if serial.starts_with("emulator-") {
        DeviceSource::Local
    } else if serial.contains(':') {
        DeviceSource::Farm
    } else {
        DeviceSource::Physical
    };

    Some(Device {
        id: serial.to_string(),
        platform: Platform::Android,
        running: state == "device",
        source,
        model,
    })
}
