//! Session management for per-run files.
//!
//! Each run gets a directory under the session base:
//! - `.session.json` metadata (id, creation time, host, platform)
//! - `scratch/` for the recording, derived data and result bundles, always
//!   removed before the run returns
//! - `frames/` for extracted stills, handed to the caller when non-empty
//!
//! A session that never produced frames removes itself entirely.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const SCRATCH_DIR: &str = "scratch";
const FRAMES_DIR: &str = "frames";
const METADATA_FILE: &str = ".session.json";

/// On-disk workspace of one run
#[derive(Debug)]
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Root directory for this session
    pub dir: PathBuf,
    /// Keep the session directory (frames) when dropped
    keep: bool,
}

#[derive(Serialize)]
struct SessionMetadata<'a> {
    id: &'a str,
    created: String,
    host: Option<String>,
    platform: &'a str,
    pid: u32,
}

impl Session {
    /// Create a session named `<name>_<timestamp>` under `base`
    pub fn with_name(base: &Path, name: &str) -> Self {
        let id = format!(
            "{}_{}_{}",
            sanitize_name(name),
            generate_timestamp_suffix(),
            std::process::id()
        );
        Self {
            dir: base.join(&id),
            id,
            keep: false,
        }
    }

    /// Keep the directory after drop
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Create directories and write metadata
    pub fn init(&self, platform: &str) -> std::io::Result<()> {
        fs::create_dir_all(self.dir.join(SCRATCH_DIR))?;
        fs::create_dir_all(self.dir.join(FRAMES_DIR))?;

        let metadata = SessionMetadata {
            id: &self.id,
            created: chrono::Utc::now().to_rfc3339(),
            host: hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
            platform,
            pid: std::process::id(),
        };
        fs::write(
            self.dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        Ok(())
    }

    /// Directory extracted frames are written to
    pub fn frames_dir(&self) -> PathBuf {
        self.dir.join(FRAMES_DIR)
    }

    /// Path for a transient file or directory
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.dir.join(SCRATCH_DIR).join(name)
    }

    /// Remove everything transient
    pub fn clear_scratch(&self) {
        let scratch = self.dir.join(SCRATCH_DIR);
        if let Err(err) = fs::remove_dir_all(&scratch) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(dir = %scratch.display(), %err, "could not remove scratch");
            }
        }
    }

    /// Close the session: drop scratch, then either hand over the frames
    /// directory (when it holds frames or the session is kept) or remove
    /// the whole session.
    pub fn finish(mut self, frame_count: usize) -> Option<PathBuf> {
        self.clear_scratch();
        if frame_count > 0 || self.keep {
            self.keep = true;
            Some(self.frames_dir())
        } else {
            None
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.clear_scratch();
        if !self.keep {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

/// Generate a timestamp suffix
fn generate_timestamp_suffix() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Sanitize a name for use in filenames
pub(crate) fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Clean up sessions older than the specified duration
pub fn cleanup_old_sessions(base: &Path, max_age: std::time::Duration) -> std::io::Result<usize> {
    if !base.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut cleaned = 0;

    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if matches!(age, Some(age) if age > max_age) && fs::remove_dir_all(&path).is_ok() {
            cleaned += 1;
        }
    }

    Ok(cleaned)
}

/// List all existing sessions
pub fn list_sessions(base: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut sessions = Vec::new();
    for entry in fs::read_dir(base)? {
        let path = entry?.path();
        if path.is_dir() {
            sessions.push(path);
        }
    }
    sessions.sort();
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_with_name() {
        let base = TempDir::new().unwrap();
        let session = Session::with_name(base.path(), "LoginTest#signIn");
        assert!(session.id.starts_with("LoginTest_signIn_"));
        assert!(session.dir.starts_with(base.path()));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("hello world"), "hello_world");
        assert_eq!(sanitize_name("emulator-5554"), "emulator-5554");
        assert_eq!(sanitize_name("a/b\\c"), "a_b_c");
    }

    #[test]
    fn test_init_writes_metadata() {
        let base = TempDir::new().unwrap();
        let session = Session::with_name(base.path(), "run");
        session.init("android").unwrap();

        let raw = fs::read_to_string(session.dir.join(METADATA_FILE)).unwrap();
        let meta: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(meta["platform"], "android");
        assert_eq!(meta["id"], session.id.as_str());
        assert!(session.frames_dir().is_dir());
    }

    #[test]
    fn test_finish_with_frames_keeps_only_frames() {
        let base = TempDir::new().unwrap();
        let session = Session::with_name(base.path(), "run");
        session.init("ios").unwrap();
        fs::write(session.scratch_path("recording.mp4"), b"video").unwrap();
        fs::write(session.frames_dir().join("frame_00001.png"), b"png").unwrap();

        let dir = session.dir.clone();
        let frames = session.finish(1).expect("frames dir kept");
        assert!(frames.join("frame_00001.png").exists());
        assert!(!dir.join(SCRATCH_DIR).exists());
    }

    #[test]
    fn test_finish_without_frames_removes_session() {
        let base = TempDir::new().unwrap();
        let session = Session::with_name(base.path(), "run");
        session.init("ios").unwrap();
        let dir = session.dir.clone();

        assert!(session.finish(0).is_none());
        assert!(!dir.exists());
    }

    #[test]
    fn test_kept_session_survives_without_frames() {
        let base = TempDir::new().unwrap();
        let session = Session::with_name(base.path(), "run").keep(true);
        session.init("android").unwrap();

        let frames = session.finish(0).expect("kept");
        assert!(frames.is_dir());
    }

    #[test]
    fn test_list_and_cleanup_sessions() {
        let base = TempDir::new().unwrap();
        fs::create_dir(base.path().join("a")).unwrap();
        fs::create_dir(base.path().join("b")).unwrap();
        assert_eq!(list_sessions(base.path()).unwrap().len(), 2);

        let cleaned = cleanup_old_sessions(base.path(), std::time::Duration::from_secs(3600)).unwrap();
        assert_eq!(cleaned, 0);
        assert_eq!(list_sessions(&base.path().join("missing")).unwrap().len(), 0);
    }
}
