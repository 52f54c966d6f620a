//! Android emulator lifecycle over `adb` and `emulator`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{DeviceDescriptor, DeviceError, DeviceLifecycle};
use crate::command::{CommandRunner, CommandSpec};
use crate::config::{AndroidSettings, emulator_serial};
use crate::wait::{Probe, await_condition};

/// `adb devices` state of a fully connected device
const STATE_DEVICE: &str = "device";

/// Fixed-serial emulator.
pub struct AndroidEmulator {
    runner: Arc<dyn CommandRunner>,
    pub adb: String,
    pub emulator: String,
    serial: String,
    settings: AndroidSettings,
}

impl AndroidEmulator {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: AndroidSettings) -> Self {
        Self {
            runner,
            adb: "adb".to_string(),
            emulator: "emulator".to_string(),
            serial: emulator_serial(settings.port),
            settings,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// `adb -s <serial> <args...>`
    pub fn adb_command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.adb)
            .args(["-s", self.serial.as_str()])
            .args(args)
    }

    /// State string `adb devices` reports for our serial, if listed.
    async fn listed_state(&self) -> Result<Option<String>, DeviceError> {
        let output = self.runner.run(&CommandSpec::new(&self.adb).arg("devices")).await?;
        if !output.success() {
            return Err(DeviceError::ToolFailed {
                command: "adb devices".to_string(),
                detail: output.failure_summary(),
            });
        }
        Ok(parse_adb_devices(&output.stdout)
            .into_iter()
            .find(|(serial, _)| serial == &self.serial)
            .map(|(_, state)| state))
    }

    async fn getprop(&self, name: &str) -> Result<String, DeviceError> {
        let output = self
            .runner
            .run(&self.adb_command(["shell", "getprop", name]))
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Listed as `device` and the boot flag is set.
    async fn is_ready(&self) -> Result<bool, DeviceError> {
        if self.listed_state().await?.as_deref() != Some(STATE_DEVICE) {
            return Ok(false);
        }
        Ok(self.getprop("sys.boot_completed").await? == "1")
    }

    async fn launch(&self) -> Result<(), DeviceError> {
        let mut spec = CommandSpec::new(&self.emulator)
            .args(["-avd", self.settings.avd.as_str()])
            .args(["-port".to_string(), self.settings.port.to_string()])
            .args(["-no-snapshot-save", "-no-boot-anim"])
            .detach();
        if self.settings.headless {
            spec = spec.args(["-no-window", "-no-audio"]);
        }
        info!(avd = %self.settings.avd, serial = %self.serial, "booting emulator");
        // The emulator outlives this run.
        let _ = self.runner.spawn(&spec).await?;
        Ok(())
    }

    async fn describe(&self) -> Result<DeviceDescriptor, DeviceError> {
        let model = self.getprop("ro.product.model").await?;
        let release = self.getprop("ro.build.version.release").await?;
        Ok(DeviceDescriptor {
            id: self.serial.clone(),
            name: if model.is_empty() { self.settings.avd.clone() } else { model },
            os_version: release,
        })
    }
}

#[async_trait]
impl DeviceLifecycle for AndroidEmulator {
    fn device_id(&self) -> &str {
        &self.serial
    }

    async fn ensure_ready(&self) -> Result<DeviceDescriptor, DeviceError> {
        if self.is_ready().await? {
            debug!(serial = %self.serial, "emulator already running");
            return self.describe().await;
        }

        // Listed but not ready (offline, still booting): wait, don't launch twice.
        if self.listed_state().await?.is_none() {
            self.launch().await?;
        }

        let probe = move || async move {
            match self.is_ready().await {
                Ok(true) => Probe::Ready(()),
                Ok(false) => Probe::Wait,
                Err(err) => {
                    debug!(%err, "readiness probe failed, retrying");
                    Probe::Wait
                }
            }
        };
        await_condition(probe, self.settings.boot_poll, self.settings.boot_timeout)
            .await
            .map_err(|elapsed| DeviceError::BootTimeout {
                device: self.serial.clone(),
                waited: elapsed.waited,
            })?;

        // sys.boot_completed flips before package manager and input are usable.
        info!(serial = %self.serial, delay = ?self.settings.settle_delay, "emulator booted, settling");
        tokio::time::sleep(self.settings.settle_delay).await;

        self.describe().await
    }
}

/// Parse `adb devices` output into `(serial, state)` pairs.
pub fn parse_adb_devices(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            Some((serial.to_string(), state.to_string()))
        })
        .collect()
}
