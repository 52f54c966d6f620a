//! Device Harness - run one mobile UI test on an emulator or simulator.
//!
//! This crate provides:
//! - A cross-process device lease with stale-owner reclamation
//! - Android emulator and iOS simulator detect-or-boot lifecycles
//! - Build / install / execute / record / clean-up pipelines per platform
//! - Pass/fail classification of raw test runner output
//! - Still-frame extraction from the screen recording
//! - Session management for per-run files
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use device_harness::command::ProcessRunner;
//! use device_harness::config;
//! use device_harness::device::AndroidEmulator;
//! use device_harness::frames::FrameExtractor;
//! use device_harness::lock::{DirLease, ExclusiveLease};
//! use device_harness::pipeline::{AndroidOptions, AndroidPipeline};
//! use device_harness::runner::TestSpec;
//! use device_harness::session::Session;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = config::get();
//! let runner = Arc::new(ProcessRunner::new());
//! let pipeline = AndroidPipeline::new(
//!     runner.clone(),
//!     AndroidEmulator::new(runner.clone(), cfg.android.clone()),
//!     FrameExtractor::new(runner, &cfg.media),
//!     AndroidOptions::default(),
//! );
//!
//! let lease = DirLease::new(&cfg.lock.dir, cfg.lock.poll_interval);
//! let guard = lease.acquire(pipeline.device_id(), cfg.lock.timeout).await?;
//! let spec = TestSpec::android("./shop", "com.example.shop", "LoginTest", "signIn");
//! let result = pipeline.run(&spec, Session::with_name(&cfg.session.base_dir, &spec.label())).await?;
//! guard.release();
//! println!("passed: {}", result.success);
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod command;
pub mod config;
pub mod device;
pub mod frames;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod runner;
pub mod session;
pub mod wait;

// Re-export run types
pub use runner::{Platform, RunResult, StepRecord, StepStatus, TestSpec};

// Re-export the building blocks
pub use classify::{Verdict, classify, extract_error_excerpt, verdict};
pub use command::{CommandRunner, ProcessRunner, ScriptedRunner};
pub use device::{AndroidEmulator, DeviceDescriptor, DeviceError, DeviceLifecycle, IosSimulator};
pub use frames::{FrameExtraction, FrameExtractor};
pub use lock::{DirLease, ExclusiveLease, LeaseGuard, LockError};
pub use pipeline::{AndroidPipeline, IosPipeline, PipelineError, Step};

// Re-export session management
pub use session::{Session, cleanup_old_sessions, list_sessions};
