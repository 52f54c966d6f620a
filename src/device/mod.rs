//! Device discovery and boot.
//!
//! One lifecycle per platform: the Android variant targets a fixed emulator
//! serial, the iOS variant picks a simulator by name family and minimum OS
//! version. Both return a [`DeviceDescriptor`] once the device is usable.

pub mod android;
pub mod ios;
pub mod version;

pub use android::AndroidEmulator;
pub use ios::{IosSimulator, SimDevice, parse_device_list};
pub use version::is_at_least;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::command::CommandError;

/// Device chosen for a run. Fixed for the run's duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Serial (Android) or UDID (iOS)
    pub id: String,
    /// Display name (AVD/model or simulator name)
    pub name: String,
    /// OS version as reported by the device
    pub os_version: String,
}

/// Errors from device discovery and boot.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no available device matches {criteria}")]
    NoQualifyingDevice { criteria: String },

    #[error("device {device} did not become ready within {waited:?}")]
    BootTimeout { device: String, waited: Duration },

    #[error("`{command}` failed: {detail}")]
    ToolFailed { command: String, detail: String },

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Brings a device to a usable state.
#[async_trait]
pub trait DeviceLifecycle: Send + Sync {
    /// Identifier the device lock is keyed on.
    fn device_id(&self) -> &str;

    /// Return the device, booting it first if it is not running.
    async fn ensure_ready(&self) -> Result<DeviceDescriptor, DeviceError>;
}
