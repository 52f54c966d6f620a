//! iOS simulator lifecycle over `xcrun simctl`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::{DeviceDescriptor, DeviceError, DeviceLifecycle, version};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::IosSettings;
use crate::wait::{Probe, await_condition};

const STATE_BOOTED: &str = "Booted";
const RUNTIME_IOS: &str = "iOS";

static SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^--\s+(?P<runtime>[A-Za-z]+)\s+(?P<version>[\d.]+)\s+--$").unwrap());

static DEVICE_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>.+?)\s+\((?P<udid>[0-9A-Fa-f]{8}(?:-[0-9A-Fa-f]{4}){3}-[0-9A-Fa-f]{12})\)\s+\((?P<state>[^)]+)\)")
        .unwrap()
});

/// One row of `simctl list devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDevice {
    pub name: String,
    pub udid: String,
    pub state: String,
    /// Runtime family from the section header ("iOS", "watchOS", ...)
    pub runtime: String,
    pub os_version: String,
}

impl SimDevice {
    pub fn is_booted(&self) -> bool {
        self.state == STATE_BOOTED
    }

    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self.udid.clone(),
            name: self.name.clone(),
            os_version: self.os_version.clone(),
        }
    }
}

/// Parse `xcrun simctl list devices` text grouped by `-- <runtime> <version> --` headers.
///
/// Rows outside a recognised section (e.g. under "Unavailable") are skipped.
pub fn parse_device_list(text: &str) -> Vec<SimDevice> {
    let mut devices = Vec::new();
    let mut section: Option<(String, String)> = None;

    for line in text.lines().map(str::trim) {
        if line.starts_with("--") {
            section = SECTION
                .captures(line)
                .map(|c| (c["runtime"].to_string(), c["version"].to_string()));
            continue;
        }
        let (Some((runtime, os_version)), Some(row)) = (&section, DEVICE_ROW.captures(line)) else {
            continue;
        };
        devices.push(SimDevice {
            name: row["name"].to_string(),
            udid: row["udid"].to_string(),
            state: row["state"].to_string(),
            runtime: runtime.clone(),
            os_version: os_version.clone(),
        });
    }
    devices
}

/// First iOS device whose name starts with `family` on a runtime at least `min_os`.
pub fn select_device<'a>(devices: &'a [SimDevice], family: &str, min_os: &str) -> Option<&'a SimDevice> {
    devices.iter().find(|d| {
        d.runtime == RUNTIME_IOS && d.name.starts_with(family) && version::is_at_least(&d.os_version, min_os)
    })
}

async fn list_devices(runner: &dyn CommandRunner, xcrun: &str) -> Result<Vec<SimDevice>, DeviceError> {
    let spec = CommandSpec::new(xcrun).args(["simctl", "list", "devices", "available"]);
    let output = runner.run(&spec).await?;
    if !output.success() {
        return Err(DeviceError::ToolFailed {
            command: spec.display(),
            detail: output.failure_summary(),
        });
    }
    Ok(parse_device_list(&output.stdout))
}

/// A simulator chosen once per run.
pub struct IosSimulator {
    runner: Arc<dyn CommandRunner>,
    xcrun: String,
    device: SimDevice,
    settings: IosSettings,
}

impl IosSimulator {
    /// Pick the simulator to use. Read-only: nothing is booted here.
    pub async fn select(runner: Arc<dyn CommandRunner>, settings: IosSettings) -> Result<Self, DeviceError> {
        let xcrun = "xcrun".to_string();
        let devices = list_devices(runner.as_ref(), &xcrun).await?;
        let device = select_device(&devices, &settings.family, &settings.min_os)
            .cloned()
            .ok_or_else(|| DeviceError::NoQualifyingDevice {
                criteria: format!("'{}*' on iOS >= {}", settings.family, settings.min_os),
            })?;

        info!(name = %device.name, udid = %device.udid, os = %device.os_version, "selected simulator");
        Ok(Self {
            runner,
            xcrun,
            device,
            settings,
        })
    }

    pub fn udid(&self) -> &str {
        &self.device.udid
    }

    pub fn device(&self) -> &SimDevice {
        &self.device
    }

    async fn current(&self) -> Result<Option<SimDevice>, DeviceError> {
        Ok(list_devices(self.runner.as_ref(), &self.xcrun)
            .await?
            .into_iter()
            .find(|d| d.udid == self.device.udid))
    }
}

#[async_trait]
impl DeviceLifecycle for IosSimulator {
    fn device_id(&self) -> &str {
        &self.device.udid
    }

    async fn ensure_ready(&self) -> Result<DeviceDescriptor, DeviceError> {
        if let Some(device) = self.current().await? {
            if device.is_booted() {
                debug!(udid = %device.udid, "simulator already booted");
                return Ok(device.descriptor());
            }
        }

        info!(udid = %self.device.udid, "booting simulator");
        let boot = CommandSpec::new(&self.xcrun).args(["simctl", "boot", self.device.udid.as_str()]);
        let output = self.runner.run(&boot).await?;
        // simctl refuses to boot an already booted device; the poll below settles it.
        if !output.success() && !output.combined().contains("current state: Booted") {
            return Err(DeviceError::ToolFailed {
                command: boot.display(),
                detail: output.failure_summary(),
            });
        }

        let probe = move || async move {
            match self.current().await {
                Ok(Some(device)) if device.is_booted() => Probe::Ready(device),
                Ok(_) => Probe::Wait,
                Err(err) => {
                    debug!(%err, "simulator listing failed, retrying");
                    Probe::Wait
                }
            }
        };
        let device = await_condition(probe, self.settings.boot_poll, self.settings.boot_timeout)
            .await
            .map_err(|elapsed| DeviceError::BootTimeout {
                device: self.device.udid.clone(),
                waited: elapsed.waited,
            })?;

        Ok(device.descriptor())
    }
}
