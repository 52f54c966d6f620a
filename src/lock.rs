//! Cross-process exclusive access to one device.
//!
//! A lease is a directory created with `mkdir` (atomic: exactly one creator
//! wins) holding an `owner.pid` file with the holder's process id. Waiters
//! poll until the directory disappears.
//!
//! # Stale lease policy
//!
//! A waiter that finds a lease whose owner is gone reclaims it instead of
//! waiting out its timeout. "Gone" means one of:
//!
//! - `owner.pid` names a process that no longer exists (`kill(pid, 0)`
//!   reports `ESRCH`; `EPERM` counts as alive),
//! - `owner.pid` is missing or unparseable and the directory is older than
//!   the initialization grace. A younger directory belongs to a holder that
//!   has not published its pid yet.
//!
//! The pid is staged in a temporary file and renamed onto `owner.pid`, so a
//! reader never observes a half-written owner.
//!
//! Reclaiming renames the directory to a unique tombstone first, so two
//! waiters that spot the same dead owner cannot both delete. The winner
//! checks the tombstone still names the owner it judged dead before
//! deleting it.
//!
//! There is no fairness among waiters: whoever's `mkdir` lands first after
//! a release wins.

use async_trait::async_trait;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::sanitize_name;
use crate::wait::{Probe, await_condition};

/// File inside the lease directory holding the owner's pid
pub const OWNER_FILE: &str = "owner.pid";

/// Prefix of every lease directory name
const LEASE_PREFIX: &str = "device-harness-";

/// How long a lease directory may exist without an owner file
pub const DEFAULT_INIT_GRACE: Duration = Duration::from_secs(2);

/// Errors from lease acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for device {device}")]
    Timeout { device: String, waited: Duration },

    #[error("lock I/O error for device {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: io::Error,
    },
}

/// Exclusive, process-wide-visible claim on a named resource.
#[async_trait]
pub trait ExclusiveLease: Send + Sync {
    /// Wait until `device_id` is free (or `timeout` elapses) and claim it.
    async fn acquire(&self, device_id: &str, timeout: Duration) -> Result<LeaseGuard, LockError>;
}

/// Held lease. Released on [`LeaseGuard::release`] or drop, whichever comes first.
#[derive(Debug)]
pub struct LeaseGuard {
    device_id: String,
    path: PathBuf,
    released: AtomicBool,
}

impl LeaseGuard {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    /// Give the device back. Safe to call any number of times; never fails.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => info!(device = %self.device_id, "released device lock"),
            Err(err) => debug!(device = %self.device_id, %err, "lock already gone on release"),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Recorded owner of an existing lease directory.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Owner {
    Pid(i32),
    Corrupt(String),
    Missing,
}

fn read_owner(dir: &Path) -> io::Result<Owner> {
    match fs::read_to_string(dir.join(OWNER_FILE)) {
        Ok(text) => Ok(match text.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Owner::Pid(pid),
            _ => Owner::Corrupt(text),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Owner::Missing),
        Err(err) => Err(err),
    }
}

/// Publish `pid` as the owner of `dir`.
///
/// Readers see either no owner file or the complete pid, never a partial write.
fn write_owner(dir: &Path, pid: u32) -> io::Result<()> {
    let staging = dir.join(format!("{}.{}.tmp", OWNER_FILE, pid));
    fs::write(&staging, pid.to_string())?;
    fs::rename(&staging, dir.join(OWNER_FILE))
}

/// Whether a process with this pid exists. Does not signal it.
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(pid: i32) -> bool {
    // No cheap probe; never reclaim.
    pid > 0
}

/// Directory-backed [`ExclusiveLease`].
#[derive(Debug, Clone)]
pub struct DirLease {
    dir: PathBuf,
    poll_interval: Duration,
    init_grace: Duration,
}

impl DirLease {
    /// Leases live as subdirectories of `dir`.
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            init_grace: DEFAULT_INIT_GRACE,
        }
    }

    pub fn init_grace(mut self, grace: Duration) -> Self {
        self.init_grace = grace;
        self
    }

    /// Deterministic lease path for a device.
    pub fn lease_path(&self, device_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.lock", LEASE_PREFIX, sanitize_name(device_id)))
    }

    /// Pid currently recorded for `device_id`, if any.
    pub fn owner_of(&self, device_id: &str) -> Option<i32> {
        match read_owner(&self.lease_path(device_id)) {
            Ok(Owner::Pid(pid)) => Some(pid),
            _ => None,
        }
    }

    /// One acquisition attempt.
    fn try_acquire(&self, device_id: &str) -> Probe<io::Result<LeaseGuard>> {
        let path = self.lease_path(device_id);

        match fs::create_dir(&path) {
            Ok(()) => {
                let pid = std::process::id();
                match write_owner(&path, pid) {
                    Ok(()) => {}
                    // Reclaimed before our pid landed; start over.
                    Err(err) if err.kind() == ErrorKind::NotFound => return Probe::Retry,
                    Err(err) => {
                        let _ = fs::remove_dir_all(&path);
                        return Probe::Ready(Err(err));
                    }
                }
                info!(device = %device_id, pid, lock = %path.display(), "acquired device lock");
                Probe::Ready(Ok(LeaseGuard {
                    device_id: device_id.to_string(),
                    path,
                    released: AtomicBool::new(false),
                }))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => self.inspect_existing(device_id, &path),
            Err(err) => Probe::Ready(Err(err)),
        }
    }

    /// Decide whether to wait for, or reclaim, a lease someone else created.
    fn inspect_existing(&self, device_id: &str, path: &Path) -> Probe<io::Result<LeaseGuard>> {
        let owner = match read_owner(path) {
            Ok(owner) => owner,
            // Released between our mkdir and the read.
            Err(err) if err.kind() == ErrorKind::NotFound => return Probe::Retry,
            Err(err) => return Probe::Ready(Err(err)),
        };

        match &owner {
            Owner::Pid(pid) if process_alive(*pid) => {
                debug!(device = %device_id, owner = pid, "device busy, waiting");
                Probe::Wait
            }
            Owner::Missing if !path.exists() => Probe::Retry,
            Owner::Missing | Owner::Corrupt(_) if !self.older_than_grace(path) => Probe::Wait,
            _ => {
                warn!(device = %device_id, ?owner, "reclaiming stale device lock");
                match reclaim(path, &owner) {
                    Ok(()) => Probe::Retry,
                    Err(err) => Probe::Ready(Err(err)),
                }
            }
        }
    }

    fn older_than_grace(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age >= self.init_grace)
            // Unknown age: let the next probe decide.
            .unwrap_or(false)
    }
}

#[async_trait]
impl ExclusiveLease for DirLease {
    async fn acquire(&self, device_id: &str, timeout: Duration) -> Result<LeaseGuard, LockError> {
        let io_err = |source| LockError::Io {
            device: device_id.to_string(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let attempt = || std::future::ready(self.try_acquire(device_id));
        match await_condition(attempt, self.poll_interval, timeout).await {
            Ok(result) => result.map_err(io_err),
            Err(elapsed) => Err(LockError::Timeout {
                device: device_id.to_string(),
                waited: elapsed.waited,
            }),
        }
    }
}

/// Move a stale lease out of the way and delete it.
fn reclaim(path: &Path, judged: &Owner) -> io::Result<()> {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let tombstone = path.with_extension(format!("stale-{}-{}", std::process::id(), nanos));

    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        // Another waiter reclaimed it first.
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    }

    let now_owner = read_owner(&tombstone).unwrap_or(Owner::Missing);
    let same = match (judged, &now_owner) {
        (Owner::Pid(a), Owner::Pid(b)) => a == b,
        (Owner::Pid(_), _) => false,
        (_, Owner::Pid(pid)) => !process_alive(*pid),
        _ => true,
    };

    if same {
        fs::remove_dir_all(&tombstone)
    } else {
        // The stale lease was replaced by a live one between our read and
        // the rename. Put it back.
        warn!(lock = %path.display(), "lease changed hands during reclaim, restoring");
        fs::rename(&tombstone, path)
    }
}
