mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::*;
use device_harness::command::{CommandOutput, Reply, ScriptedRunner};
use device_harness::config::Config;
use device_harness::device::AndroidEmulator;
use device_harness::frames::{FrameExtractor, FrameManifest, MANIFEST_FILE};
use device_harness::pipeline::{AndroidOptions, AndroidPipeline, PipelineError, Step};
use device_harness::runner::{StepStatus, TestSpec};
use device_harness::session::Session;

const ADB: [&str; 2] = ["-s", SERIAL];

fn adb<'a>(rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = ADB.to_vec();
    args.extend_from_slice(rest);
    args
}

/// A healthy emulator and toolchain; individual tests override single commands.
fn scripted() -> ScriptedRunner {
    let runner = ScriptedRunner::new();
    runner.on("gradle", &[], Reply::ok("BUILD SUCCESSFUL in 12s"));
    runner.on("adb", &["devices"], Reply::ok(ADB_LISTED));
    runner.on("adb", &adb(&["shell", "getprop", "sys.boot_completed"]), Reply::ok("1\n"));
    runner.on("adb", &adb(&["shell", "getprop", "ro.product.model"]), Reply::ok("sdk_gphone64_x86_64\n"));
    runner.on("adb", &adb(&["shell", "getprop", "ro.build.version.release"]), Reply::ok("14\n"));
    runner.on("adb", &adb(&["install"]), Reply::ok("Performing Streamed Install\nSuccess\n"));
    runner.on("adb", &adb(&["shell", "am", "instrument"]), Reply::ok(PASSING_INSTRUMENTATION));
    runner.on("adb", &adb(&["pull"]), writes_last_arg("1 file pulled"));
    runner.on("adb", &adb(&["uninstall"]), Reply::ok("Success\n"));
    runner.on("ffprobe", &[], Reply::ok("3.2\n"));
    runner.on("ffmpeg", &[], writes_frames(3));
    runner
}

fn pipeline(runner: &ScriptedRunner) -> AndroidPipeline {
    let media = Config::defaults().media;
    AndroidPipeline::new(
        Arc::new(runner.clone()),
        AndroidEmulator::new(Arc::new(runner.clone()), android_settings()),
        FrameExtractor::new(Arc::new(runner.clone()), &media),
        AndroidOptions {
            recording_settle: Duration::ZERO,
            ..AndroidOptions::default()
        },
    )
}

fn spec(project: &TempDir) -> TestSpec {
    TestSpec::android(project.path(), "com.example.shop", "LoginTest", "signIn")
}

#[tokio::test]
async fn passing_run_records_frames_and_cleans_up() {
    let runner = scripted();
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);
    let session = Session::with_name(sessions.path(), &spec.label());
    let session_dir = session.dir.clone();

    let result = pipeline(&runner).run(&spec, session).await.unwrap();

    assert!(result.success);
    assert!(result.error_excerpt.is_none());
    assert_eq!(result.frame_count, 3);
    let frames = result.frames_dir.clone().expect("frames dir");
    assert_eq!(png_count(&frames), 3);
    let manifest = FrameManifest::load(&frames).unwrap();
    assert_eq!(manifest.frames.len(), 3);
    assert_eq!(manifest.frames[0].width, Some(8));
    assert!(frames.join(MANIFEST_FILE).exists());
    // Recording and other scratch files are gone.
    assert!(!session_dir.join("scratch").exists());

    let device = result.device.as_ref().unwrap();
    assert_eq!(device.id, SERIAL);
    assert_eq!(device.os_version, "14");

    let steps: Vec<Step> = result.steps.iter().map(|r| r.step).collect();
    assert_eq!(
        steps,
        vec![
            Step::BuildApp,
            Step::BuildTestArtifact,
            Step::EnsureDevice,
            Step::InstallApp,
            Step::InstallTestArtifact,
            Step::StartRecording,
            Step::Execute,
            Step::RetrieveRecording,
            Step::ExtractFrames,
            Step::DeleteLocalRecording,
            Step::UninstallApp,
            Step::UninstallTestArtifact,
        ]
    );
    assert!(result.steps.iter().all(|r| r.status == StepStatus::Ok));
}

#[tokio::test]
async fn commands_run_in_pipeline_order() {
    let runner = scripted();
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);

    pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "order"))
        .await
        .unwrap();

    let lines = runner.command_lines();
    let build = position(&lines, "assembleDebug");
    let build_tests = position(&lines, "assembleDebugAndroidTest");
    let install = position(&lines, "install -r -t");
    let instrument = position(&lines, "am instrument");
    let pull = position(&lines, " pull ");
    let uninstall_app = position(&lines, "uninstall com.example.shop");
    let uninstall_tests = position(&lines, "uninstall com.example.shop.test");
    assert!(build < build_tests && build_tests < install);
    assert!(install < instrument && instrument < pull && pull < uninstall_app);
    assert!(uninstall_app < uninstall_tests);

    let instrument_line = &lines[instrument];
    assert!(instrument_line.contains("-e class com.example.shop.LoginTest#signIn"));
    assert!(instrument_line.ends_with("com.example.shop.test/androidx.test.runner.AndroidJUnitRunner"));

    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 1);
    assert!(spawned[0].args.contains(&"screenrecord".to_string()));
    // The recorder dies with its handle if the run is cancelled.
    assert!(!spawned[0].detached);
    assert_eq!(runner.interrupted(), vec!["adb".to_string()]);
}

#[tokio::test]
async fn failing_test_is_a_result_not_an_error() {
    let runner = scripted();
    runner.on(
        "adb",
        &adb(&["shell", "am", "instrument"]),
        Reply::output(CommandOutput {
            stdout: FAILING_INSTRUMENTATION.to_string(),
            stderr: String::new(),
            exit_code: Some(1),
        }),
    );
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);

    let result = pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "fail"))
        .await
        .unwrap();

    assert!(!result.success);
    let excerpt = result.error_excerpt.as_deref().unwrap();
    assert!(excerpt.starts_with("androidx.test.espresso.NoMatchingViewException"));
    assert!(excerpt.contains("LoginTest.kt:31"));
    assert!(!excerpt.contains("INSTRUMENTATION_STATUS"));
    assert!(!result.signals.is_empty());

    // Cleanup still happened.
    assert!(runner.ran("adb", &adb(&["uninstall", "com.example.shop"])));
    assert!(runner.ran("adb", &adb(&["uninstall", "com.example.shop.test"])));
}

#[tokio::test]
async fn missing_project_fails_before_touching_devices() {
    let runner = scripted();
    let sessions = TempDir::new().unwrap();
    let spec = TestSpec::android("/no/such/project", "com.example.shop", "LoginTest", "signIn");

    let err = pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "missing"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ProjectNotFound(_)));
    assert!(runner.calls().is_empty());
    assert!(runner.spawned().is_empty());
}

#[tokio::test]
async fn build_failure_is_fatal_and_named() {
    let runner = scripted();
    runner.on("gradle", &["assembleDebug"], Reply::failed(1, "FAILURE: Build failed with an exception."));
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);

    let err = pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "build"))
        .await
        .unwrap_err();

    assert_eq!(err.step(), Some(Step::BuildApp));
    assert!(err.to_string().contains("build_app"));
    assert!(!runner.ran("adb", &[]));
    // Nothing is left behind in the session base.
    assert_eq!(std::fs::read_dir(sessions.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn install_failure_reported_in_text_is_fatal() {
    let runner = scripted();
    runner.on("adb", &adb(&["install"]), Reply::ok("Failure [INSTALL_FAILED_VERSION_DOWNGRADE]\n"));
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);

    let err = pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "install"))
        .await
        .unwrap_err();
    assert_eq!(err.step(), Some(Step::InstallApp));
}

#[tokio::test]
async fn unreachable_test_runner_is_fatal_and_stops_recorder() {
    let runner = scripted();
    runner.on("adb", &adb(&["shell", "am", "instrument"]), Reply::spawn_error());
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);

    let err = pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "exec"))
        .await
        .unwrap_err();

    assert_eq!(err.step(), Some(Step::Execute));
    assert_eq!(runner.interrupted().len(), 1);
}

#[tokio::test]
async fn lost_recording_does_not_change_the_verdict() {
    let runner = scripted();
    runner.on("adb", &adb(&["pull"]), Reply::failed(1, "remote object does not exist"));
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);

    let result = pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "norec"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.frame_count, 0);
    assert!(result.frames_dir.is_none());

    let status = |step: Step| result.steps.iter().find(|r| r.step == step).map(|r| r.status);
    assert_eq!(status(Step::RetrieveRecording), Some(StepStatus::Failed));
    assert_eq!(status(Step::ExtractFrames), Some(StepStatus::Skipped));
    assert_eq!(status(Step::UninstallApp), Some(StepStatus::Ok));
    assert!(!runner.ran("ffmpeg", &[]));
}

#[tokio::test]
async fn uninstall_failures_are_independent() {
    let runner = scripted();
    runner.on("adb", &adb(&["uninstall", "com.example.shop"]), Reply::failed(1, "Failure [DELETE_FAILED_INTERNAL_ERROR]"));
    runner.on("adb", &adb(&["uninstall", "com.example.shop.test"]), Reply::ok("Success\n"));
    let project = android_project();
    let sessions = TempDir::new().unwrap();
    let spec = spec(&project);

    let result = pipeline(&runner)
        .run(&spec, Session::with_name(sessions.path(), "uninstall"))
        .await
        .unwrap();

    assert!(result.success);
    let status = |step: Step| result.steps.iter().find(|r| r.step == step).map(|r| r.status);
    assert_eq!(status(Step::UninstallApp), Some(StepStatus::Failed));
    assert_eq!(status(Step::UninstallTestArtifact), Some(StepStatus::Ok));
}
