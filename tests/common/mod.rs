//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use device_harness::command::{CommandSpec, Reply};
use device_harness::config::{AndroidSettings, Config, IosSettings};

pub const SERIAL: &str = "emulator-5554";
pub const UDID: &str = "AAAAAAAA-BBBB-CCCC-DDDD-EEEEEEEEEEEE";

pub const ADB_LISTED: &str = "List of devices attached\nemulator-5554\tdevice\n\n";

pub const PASSING_INSTRUMENTATION: &str = "\
INSTRUMENTATION_STATUS: class=com.example.shop.LoginTest
INSTRUMENTATION_STATUS: test=signIn
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.shop.LoginTest
INSTRUMENTATION_STATUS: test=signIn
INSTRUMENTATION_STATUS_CODE: 0
INSTRUMENTATION_RESULT: stream=

Time: 2.8

OK (1 test)


INSTRUMENTATION_CODE: -1
";

pub const FAILING_INSTRUMENTATION: &str = "\
INSTRUMENTATION_STATUS: class=com.example.shop.LoginTest
INSTRUMENTATION_STATUS: test=signIn
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.shop.LoginTest
INSTRUMENTATION_STATUS: stack=androidx.test.espresso.NoMatchingViewException: No views in hierarchy found matching: with id: home
\tat com.example.shop.LoginTest.signIn(LoginTest.kt:31)

INSTRUMENTATION_STATUS: test=signIn
INSTRUMENTATION_STATUS_CODE: -2
INSTRUMENTATION_RESULT: stream=
Tests run: 1,  Failures: 1

INSTRUMENTATION_CODE: -1
";

pub fn android_settings() -> AndroidSettings {
    AndroidSettings {
        boot_timeout: Duration::from_millis(300),
        boot_poll: Duration::from_millis(10),
        settle_delay: Duration::from_millis(1),
        ..Config::defaults().android
    }
}

pub fn ios_settings() -> IosSettings {
    IosSettings {
        boot_timeout: Duration::from_millis(300),
        boot_poll: Duration::from_millis(10),
        ..Config::defaults().ios
    }
}

pub fn simctl_listing(state: &str) -> String {
    format!(
        "== Devices ==\n\
         -- iOS 16.4 --\n    iPhone 14 (11111111-2222-3333-4444-555555555555) (Shutdown)\n\
         -- iOS 17.2 --\n    iPhone 15 ({UDID}) ({state})\n"
    )
}

/// Gradle project with both debug APKs already built.
pub fn android_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let apk = dir.path().join("app/build/outputs/apk");
    fs::create_dir_all(apk.join("debug")).unwrap();
    fs::create_dir_all(apk.join("androidTest/debug")).unwrap();
    fs::write(apk.join("debug/app-debug.apk"), b"apk").unwrap();
    fs::write(apk.join("androidTest/debug/app-debug-androidTest.apk"), b"apk").unwrap();
    dir
}

/// Xcode project directory holding a workspace and a project.
pub fn ios_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("Shop.xcodeproj")).unwrap();
    fs::create_dir(dir.path().join("Shop.xcworkspace")).unwrap();
    dir
}

/// Value following `flag` in a command's arguments.
pub fn arg_after(spec: &CommandSpec, flag: &str) -> Option<String> {
    spec.args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| spec.args.get(i + 1).cloned())
}

/// Reply that writes a small file at the path given as the last argument.
pub fn writes_last_arg(stdout: &str) -> Reply {
    Reply::ok(stdout).with_effect(|spec| {
        let path = PathBuf::from(spec.args.last().cloned().unwrap_or_default());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"mp4 bytes").unwrap();
    })
}

/// Mimic ffmpeg writing `count` numbered PNG frames.
pub fn writes_frames(count: usize) -> Reply {
    Reply::ok("").with_effect(move |spec| {
        let pattern = spec.args.last().cloned().unwrap_or_default();
        for i in 1..=count {
            let path = pattern.replace("%05d", &format!("{:05}", i));
            image::RgbImage::new(8, 4).save(&path).unwrap();
        }
    })
}

pub fn png_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .map(|e| e.path().extension().map(|x| x == "png").unwrap_or(false))
                .unwrap_or(false)
        })
        .count()
}

/// Index of the first recorded command line containing `needle`.
pub fn position(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no command containing {needle:?} in {lines:#?}"))
}
