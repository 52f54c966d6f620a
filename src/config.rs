//! Configuration management with environment variable support.
//!
//! Every tunable of a run (lock placement and timing, emulator and simulator
//! selection, boot budgets, media tools) can be set from the environment.
//! CLI flags override the values read here.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DEVICE_HARNESS_LOCK_DIR` | Directory holding device lock directories | system temp dir |
//! | `DEVICE_HARNESS_SESSION_DIR` | Base directory for run sessions | `<temp>/device-harness` |
//! | `DEVICE_HARNESS_LOCK_TIMEOUT` | Lock acquisition timeout (seconds) | `900` |
//! | `DEVICE_HARNESS_LOCK_POLL` | Lock poll interval (milliseconds) | `2000` |
//! | `DEVICE_HARNESS_AVD` | Android virtual device to boot | `Pixel_7_API_34` |
//! | `DEVICE_HARNESS_EMULATOR_PORT` | Emulator console port | `5554` |
//! | `DEVICE_HARNESS_HEADLESS` | Boot the emulator without a window | `false` |
//! | `DEVICE_HARNESS_BOOT_TIMEOUT` | Device boot budget (seconds) | `180` |
//! | `DEVICE_HARNESS_SETTLE_DELAY` | Extra wait after Android boot (seconds) | `5` |
//! | `DEVICE_HARNESS_SIM_FAMILY` | Simulator name prefix | `iPhone` |
//! | `DEVICE_HARNESS_MIN_OS` | Minimum simulator OS version | `17.0` |
//! | `DEVICE_HARNESS_FFMPEG` | ffmpeg executable | `ffmpeg` |
//! | `DEVICE_HARNESS_FFPROBE` | ffprobe executable | `ffprobe` |
//!
//! # Example
//!
//! ```bash
//! export DEVICE_HARNESS_AVD="Pixel_8_API_35"
//! export DEVICE_HARNESS_HEADLESS=1
//! device-harness android ./app com.example.app LoginTest signInShowsHome
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

/// Default lock acquisition timeout (seconds)
pub const DEFAULT_LOCK_TIMEOUT: u64 = 900;

/// Default lock poll interval (milliseconds)
pub const DEFAULT_LOCK_POLL_MS: u64 = 2000;

/// Default Android virtual device name
pub const DEFAULT_AVD: &str = "Pixel_7_API_34";

/// Default emulator console port (serial becomes `emulator-5554`)
pub const DEFAULT_EMULATOR_PORT: u16 = 5554;

/// Default Android boot budget (seconds)
pub const DEFAULT_ANDROID_BOOT_TIMEOUT: u64 = 180;

/// Default iOS boot budget (seconds)
pub const DEFAULT_IOS_BOOT_TIMEOUT: u64 = 120;

/// Default boot readiness poll interval (milliseconds)
pub const DEFAULT_BOOT_POLL_MS: u64 = 2000;

/// Default settle delay after the Android boot flag flips (seconds)
pub const DEFAULT_SETTLE_DELAY: u64 = 5;

/// Default simulator family prefix
pub const DEFAULT_SIM_FAMILY: &str = "iPhone";

/// Default minimum simulator OS version
pub const DEFAULT_MIN_OS: &str = "17.0";

/// Default ffmpeg executable
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Default ffprobe executable
pub const DEFAULT_FFPROBE: &str = "ffprobe";

/// Session directory name under the system temp dir
const SESSION_DIR_NAME: &str = "device-harness";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_LOCK_DIR: &str = "DEVICE_HARNESS_LOCK_DIR";
pub const ENV_SESSION_DIR: &str = "DEVICE_HARNESS_SESSION_DIR";
pub const ENV_LOCK_TIMEOUT: &str = "DEVICE_HARNESS_LOCK_TIMEOUT";
pub const ENV_LOCK_POLL: &str = "DEVICE_HARNESS_LOCK_POLL";
pub const ENV_AVD: &str = "DEVICE_HARNESS_AVD";
pub const ENV_EMULATOR_PORT: &str = "DEVICE_HARNESS_EMULATOR_PORT";
pub const ENV_HEADLESS: &str = "DEVICE_HARNESS_HEADLESS";
pub const ENV_BOOT_TIMEOUT: &str = "DEVICE_HARNESS_BOOT_TIMEOUT";
pub const ENV_SETTLE_DELAY: &str = "DEVICE_HARNESS_SETTLE_DELAY";
pub const ENV_SIM_FAMILY: &str = "DEVICE_HARNESS_SIM_FAMILY";
pub const ENV_MIN_OS: &str = "DEVICE_HARNESS_MIN_OS";
pub const ENV_FFMPEG: &str = "DEVICE_HARNESS_FFMPEG";
pub const ENV_FFPROBE: &str = "DEVICE_HARNESS_FFPROBE";

/// Log filter override, checked before `RUST_LOG`
pub const ENV_LOG: &str = "DEVICE_HARNESS_LOG";

// ============================================================================
// Configuration
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub lock: LockSettings,
    pub session: SessionSettings,
    pub android: AndroidSettings,
    pub ios: IosSettings,
    pub media: MediaSettings,
}

/// Device lock placement and timing
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Directory where lock directories are created
    pub dir: PathBuf,
    /// How long to wait for a busy device
    pub timeout: Duration,
    /// Delay between attempts while the owner is alive
    pub poll_interval: Duration,
}

/// Session-related settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Base directory for session storage
    pub base_dir: PathBuf,
}

/// Android emulator settings
#[derive(Debug, Clone)]
pub struct AndroidSettings {
    pub avd: String,
    pub port: u16,
    pub headless: bool,
    pub boot_timeout: Duration,
    pub boot_poll: Duration,
    pub settle_delay: Duration,
}

/// iOS simulator settings
#[derive(Debug, Clone)]
pub struct IosSettings {
    /// Device name prefix (e.g. "iPhone")
    pub family: String,
    /// Minimum runtime version, dot separated
    pub min_os: String,
    pub boot_timeout: Duration,
    pub boot_poll: Duration,
}

/// External media tools
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self::from_lookup(|_| None)
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to the default for that key.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str, default: u64| {
            Duration::from_secs(parse_or(lookup(key), default))
        };
        let millis = |key: &str, default: u64| {
            Duration::from_millis(parse_or(lookup(key), default))
        };

        Self {
            lock: LockSettings {
                dir: lookup(ENV_LOCK_DIR)
                    .map(PathBuf::from)
                    .unwrap_or_else(env::temp_dir),
                timeout: secs(ENV_LOCK_TIMEOUT, DEFAULT_LOCK_TIMEOUT),
                poll_interval: millis(ENV_LOCK_POLL, DEFAULT_LOCK_POLL_MS),
            },
            session: SessionSettings {
                base_dir: lookup(ENV_SESSION_DIR)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| env::temp_dir().join(SESSION_DIR_NAME)),
            },
            android: AndroidSettings {
                avd: lookup(ENV_AVD).unwrap_or_else(|| DEFAULT_AVD.to_string()),
                port: parse_or(lookup(ENV_EMULATOR_PORT), DEFAULT_EMULATOR_PORT),
                headless: lookup(ENV_HEADLESS).map(|v| parse_flag(&v)).unwrap_or(false),
                boot_timeout: secs(ENV_BOOT_TIMEOUT, DEFAULT_ANDROID_BOOT_TIMEOUT),
                boot_poll: Duration::from_millis(DEFAULT_BOOT_POLL_MS),
                settle_delay: secs(ENV_SETTLE_DELAY, DEFAULT_SETTLE_DELAY),
            },
            ios: IosSettings {
                family: lookup(ENV_SIM_FAMILY).unwrap_or_else(|| DEFAULT_SIM_FAMILY.to_string()),
                min_os: lookup(ENV_MIN_OS).unwrap_or_else(|| DEFAULT_MIN_OS.to_string()),
                boot_timeout: secs(ENV_BOOT_TIMEOUT, DEFAULT_IOS_BOOT_TIMEOUT),
                boot_poll: Duration::from_millis(DEFAULT_BOOT_POLL_MS),
            },
            media: MediaSettings {
                ffmpeg: lookup(ENV_FFMPEG).unwrap_or_else(|| DEFAULT_FFMPEG.to_string()),
                ffprobe: lookup(ENV_FFPROBE).unwrap_or_else(|| DEFAULT_FFPROBE.to_string()),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Interpret common truthy spellings ("1", "true", "yes", "on")
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Serial the emulator registers under for a console port
pub fn emulator_serial(port: u16) -> String {
    format!("emulator-{}", port)
}
