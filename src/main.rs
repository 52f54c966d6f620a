use clap::{CommandFactory, Parser, Subcommand};
use std::future::Future;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use device_harness::command::{CommandRunner, ProcessRunner};
use device_harness::config::{self, Config};
use device_harness::device::{AndroidEmulator, IosSimulator};
use device_harness::frames::FrameExtractor;
use device_harness::lock::{DirLease, ExclusiveLease};
use device_harness::logging::{LogFormat, init_logging};
use device_harness::pipeline::{AndroidOptions, AndroidPipeline, IosOptions, IosPipeline, PipelineError};
use device_harness::runner::{Platform, RunResult, TestSpec};
use device_harness::session::{Session, cleanup_old_sessions, list_sessions};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_SIGINT: u8 = 130;
const EXIT_SIGTERM: u8 = 143;

/// Device Harness - run one mobile UI test on an emulator or simulator
#[derive(Parser, Debug)]
#[command(
    name = "device-harness",
    version,
    about = "Build, install and run a single UI test on a locked device, recording the screen",
    after_help = "ENVIRONMENT VARIABLES:\n\
        DEVICE_HARNESS_LOCK_DIR       Directory for device lock directories\n\
        DEVICE_HARNESS_LOCK_TIMEOUT   Seconds to wait for a busy device\n\
        DEVICE_HARNESS_SESSION_DIR    Base directory for run sessions\n\
        DEVICE_HARNESS_AVD            Android virtual device to boot\n\
        DEVICE_HARNESS_EMULATOR_PORT  Emulator console port\n\
        DEVICE_HARNESS_HEADLESS       Boot the emulator without a window\n\
        DEVICE_HARNESS_SIM_FAMILY     Simulator name prefix (e.g. iPhone)\n\
        DEVICE_HARNESS_MIN_OS         Minimum simulator iOS version\n\
        DEVICE_HARNESS_LOG            Log filter (falls back to RUST_LOG)"
)]
struct Args {
    /// Write logs to stderr as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Args, Debug)]
struct RunFlags {
    /// Print the run result as JSON
    #[arg(long)]
    json: bool,

    /// Keep the frames directory even when no frames were extracted
    #[arg(long)]
    keep_frames_dir: bool,

    /// Seconds to wait for the device lock
    #[arg(long, value_name = "SECS")]
    lock_timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an instrumentation test on the Android emulator
    Android {
        /// App project directory
        project: String,

        /// Application id (e.g. com.example.shop)
        package: String,

        /// Test class, bare or fully qualified
        suite: String,

        /// Test method
        test: String,

        /// AVD to boot when no emulator is running
        #[arg(long)]
        avd: Option<String>,

        /// Gradle module holding the app
        #[arg(long, default_value = "app")]
        module: String,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// Run a UI test on an iOS simulator
    Ios {
        /// Directory holding the .xcworkspace or .xcodeproj
        project: String,

        /// Test identifier, `Class/method`
        test: String,

        /// Scheme to build (default: project file name)
        #[arg(long)]
        scheme: Option<String>,

        /// UI test target (default: <scheme>UITests)
        #[arg(long)]
        ui_test_target: Option<String>,

        #[command(flatten)]
        flags: RunFlags,
    },

    /// List run sessions, optionally pruning old ones
    Sessions {
        /// Remove sessions older than this many hours first
        #[arg(long, value_name = "HOURS")]
        prune_older_than: Option<u64>,
    },
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_FAILURE } else { EXIT_SUCCESS };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    init_logging(if args.log_json { LogFormat::Json } else { LogFormat::Human });

    let Some(command) = args.command else {
        print_usage(None);
        return ExitCode::from(EXIT_FAILURE);
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: could not start runtime: {}", err);
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    ExitCode::from(runtime.block_on(dispatch(command)))
}

async fn dispatch(command: Commands) -> u8 {
    match command {
        Commands::Android {
            project,
            package,
            suite,
            test,
            avd,
            module,
            flags,
        } => {
            if any_blank(&[&project, &package, &suite, &test]) {
                print_usage(Some("android"));
                return EXIT_FAILURE;
            }
            let mut cfg = config::get().clone();
            if let Some(avd) = avd {
                cfg.android.avd = avd;
            }
            let spec = TestSpec::android(project, package, suite, test);
            let options = AndroidOptions {
                module,
                ..AndroidOptions::default()
            };
            run_android(&cfg, spec, options, &flags).await
        }

        Commands::Ios {
            project,
            test,
            scheme,
            ui_test_target,
            flags,
        } => {
            if any_blank(&[&project, &test]) {
                print_usage(Some("ios"));
                return EXIT_FAILURE;
            }
            let cfg = config::get().clone();
            let spec = TestSpec::ios(project, test);
            let options = IosOptions {
                scheme,
                ui_test_target,
                ..IosOptions::default()
            };
            run_ios(&cfg, spec, options, &flags).await
        }

        Commands::Sessions { prune_older_than } => sessions(&config::get().session.base_dir, prune_older_than),
    }
}

async fn run_android(cfg: &Config, spec: TestSpec, options: AndroidOptions, flags: &RunFlags) -> u8 {
    if let Err(err) = spec.validate(Platform::Android) {
        eprintln!("Error: {}", err);
        return EXIT_FAILURE;
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    let pipeline = AndroidPipeline::new(
        runner.clone(),
        AndroidEmulator::new(runner.clone(), cfg.android.clone()),
        FrameExtractor::new(runner, &cfg.media),
        options,
    );
    let session = Session::with_name(&cfg.session.base_dir, &spec.label()).keep(flags.keep_frames_dir);
    guarded(cfg, flags, pipeline.device_id(), pipeline.run(&spec, session)).await
}

async fn run_ios(cfg: &Config, spec: TestSpec, options: IosOptions, flags: &RunFlags) -> u8 {
    if let Err(err) = spec.validate(Platform::Ios) {
        eprintln!("Error: {}", err);
        return EXIT_FAILURE;
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    // The lock is keyed on the UDID, so selection (read-only) comes first.
    let simulator = match IosSimulator::select(runner.clone(), cfg.ios.clone()).await {
        Ok(simulator) => simulator,
        Err(err) => {
            eprintln!("Error: step ensure_device failed: {}", err);
            return EXIT_FAILURE;
        }
    };
    let pipeline = IosPipeline::new(
        runner.clone(),
        simulator,
        FrameExtractor::new(runner, &cfg.media),
        options,
    );
    let session = Session::with_name(&cfg.session.base_dir, &spec.label()).keep(flags.keep_frames_dir);
    guarded(cfg, flags, pipeline.device_id(), pipeline.run(&spec, session)).await
}

/// Hold the device lease around `run`, releasing it on every exit path
/// including SIGINT and SIGTERM.
async fn guarded<F>(cfg: &Config, flags: &RunFlags, device_id: &str, run: F) -> u8
where
    F: Future<Output = Result<RunResult, PipelineError>>,
{
    let lease = DirLease::new(&cfg.lock.dir, cfg.lock.poll_interval);
    let timeout = flags.lock_timeout.map(Duration::from_secs).unwrap_or(cfg.lock.timeout);
    // Installed once so a signal between the two waits below is not lost.
    let mut shutdown = Shutdown::install();

    let guard = tokio::select! {
        acquired = lease.acquire(device_id, timeout) => match acquired {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("Error: {}", err);
                return EXIT_FAILURE;
            }
        },
        code = shutdown.recv() => return code,
    };

    let outcome = tokio::select! {
        outcome = run => outcome,
        code = shutdown.recv() => {
            guard.release();
            return code;
        }
    };
    guard.release();

    match outcome {
        Ok(result) => report(&result, flags.json),
        Err(err) => {
            error!(%err, "run aborted");
            eprintln!("Error: {}", err);
            EXIT_FAILURE
        }
    }
}

/// SIGINT / SIGTERM listener shared by every wait of a run.
#[cfg(unix)]
struct Shutdown {
    streams: Option<(tokio::signal::unix::Signal, tokio::signal::unix::Signal)>,
}

#[cfg(unix)]
impl Shutdown {
    fn install() -> Self {
        use tokio::signal::unix::{SignalKind, signal};

        let streams = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(interrupt), Ok(terminate)) => Some((interrupt, terminate)),
            _ => {
                warn!("could not install signal handlers");
                None
            }
        };
        Self { streams }
    }

    /// Resolves with the exit code for the next termination signal.
    async fn recv(&mut self) -> u8 {
        let Some((interrupt, terminate)) = self.streams.as_mut() else {
            return std::future::pending().await;
        };
        tokio::select! {
            _ = interrupt.recv() => {
                warn!("interrupted, releasing device");
                EXIT_SIGINT
            }
            _ = terminate.recv() => {
                warn!("terminated, releasing device");
                EXIT_SIGTERM
            }
        }
    }
}

#[cfg(not(unix))]
struct Shutdown;

#[cfg(not(unix))]
impl Shutdown {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) -> u8 {
        if tokio::signal::ctrl_c().await.is_err() {
            return std::future::pending().await;
        }
        warn!("interrupted, releasing device");
        EXIT_SIGINT
    }
}

fn report(result: &RunResult, json: bool) -> u8 {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(text) => println!("{}", text),
            Err(err) => eprintln!("Error: could not serialize result: {}", err),
        }
    } else {
        println!("{}", if result.success { "PASS" } else { "FAIL" });
        if let Some(device) = &result.device {
            println!("  Device: {} ({}, OS {})", device.name, device.id, device.os_version);
        }
        if let (true, Some(dir)) = (result.frame_count > 0, &result.frames_dir) {
            println!("  Frames: {} in {}", result.frame_count, dir.display());
        }
        if !result.success {
            println!();
            println!("{}", result.failure_text().trim_end());
        }
    }

    if result.success { EXIT_SUCCESS } else { EXIT_FAILURE }
}

fn sessions(base: &Path, prune_older_than: Option<u64>) -> u8 {
    if let Some(hours) = prune_older_than {
        match cleanup_old_sessions(base, Duration::from_secs(hours * 3600)) {
            Ok(removed) => println!("Removed {} session(s) older than {}h", removed, hours),
            Err(err) => {
                eprintln!("Error: could not prune {}: {}", base.display(), err);
                return EXIT_FAILURE;
            }
        }
    }

    match list_sessions(base) {
        Ok(sessions) if sessions.is_empty() => println!("No sessions in {}", base.display()),
        Ok(sessions) => {
            for session in sessions {
                println!("{}", session.display());
            }
        }
        Err(err) => {
            eprintln!("Error: could not list {}: {}", base.display(), err);
            return EXIT_FAILURE;
        }
    }
    EXIT_SUCCESS
}

fn any_blank(values: &[&str]) -> bool {
    values.iter().any(|v| v.trim().is_empty())
}

fn print_usage(subcommand: Option<&str>) {
    let mut cmd = Args::command();
    cmd.build();
    if let Some(sub) = subcommand.and_then(|name| cmd.find_subcommand_mut(name)) {
        eprintln!("{}", sub.render_usage());
        return;
    }
    eprintln!("{}", cmd.render_usage());
}
