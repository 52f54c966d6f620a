//! Still frames from a screen recording.
//!
//! Policy by probed duration:
//! - under one second (but non-zero): decode every frame at its native
//!   timing and keep only the last one, the settled end state of a short
//!   interaction
//! - anything else, including an unknown duration: one frame per second
//!
//! If either branch produces nothing, the keep-last pass runs once more as a
//! fallback so any decodable recording yields at least one frame.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::manifest::write_manifest;
use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::MediaSettings;

/// File name prefix of every extracted frame
pub const FRAME_PREFIX: &str = "frame_";

/// ffmpeg output pattern. Fixed-width numbering keeps lexicographic order
/// equal to chronological order.
pub const FRAME_PATTERN: &str = "frame_%05d.png";

/// Recordings shorter than this keep only their final frame
const SHORT_CLIP_SECS: f64 = 1.0;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("recording not found: {0}")]
    MissingVideo(PathBuf),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sampling strategy that produced the frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Variable frame rate, last frame kept
    LastFrame,
    /// Fixed 1 fps, every frame kept
    EverySecond,
    /// Keep-last retry after the first pass produced nothing
    Fallback,
}

/// Result of one extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameExtraction {
    pub frame_count: usize,
    /// Probed duration in seconds (0 when the probe failed)
    pub duration: f64,
    pub strategy: Strategy,
    /// Frame files in chronological order
    pub frames: Vec<PathBuf>,
}

/// Drives ffprobe and ffmpeg.
pub struct FrameExtractor {
    runner: Arc<dyn CommandRunner>,
    ffmpeg: String,
    ffprobe: String,
}

impl FrameExtractor {
    pub fn new(runner: Arc<dyn CommandRunner>, media: &MediaSettings) -> Self {
        Self {
            runner,
            ffmpeg: media.ffmpeg.clone(),
            ffprobe: media.ffprobe.clone(),
        }
    }

    /// Duration of `video` in seconds; 0 when it cannot be determined.
    pub async fn probe_duration(&self, video: &Path) -> f64 {
        let spec = CommandSpec::new(&self.ffprobe).args([
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "csv=p=0".to_string(),
            video.display().to_string(),
        ]);

        match self.runner.run(&spec).await {
            Ok(output) if output.success() => parse_duration(&output.stdout),
            Ok(output) => {
                debug!(detail = %output.failure_summary(), "duration probe failed");
                0.0
            }
            Err(err) => {
                debug!(%err, "duration probe could not run");
                0.0
            }
        }
    }

    /// Extract frames from `video` into `out_dir`.
    pub async fn extract(&self, video: &Path, out_dir: &Path) -> Result<FrameExtraction, ExtractError> {
        if !video.is_file() {
            return Err(ExtractError::MissingVideo(video.to_path_buf()));
        }
        fs::create_dir_all(out_dir)?;

        let duration = self.probe_duration(video).await;
        let (mut strategy, mut frames) = if duration > 0.0 && duration < SHORT_CLIP_SECS {
            (Strategy::LastFrame, self.sample_last(video, out_dir).await?)
        } else {
            (Strategy::EverySecond, self.sample_every_second(video, out_dir).await?)
        };

        if frames.is_empty() {
            warn!(video = %video.display(), duration, "no frames extracted, retrying with last-frame fallback");
            strategy = Strategy::Fallback;
            frames = self.sample_last(video, out_dir).await?;
        }

        let extraction = FrameExtraction {
            frame_count: frames.len(),
            duration,
            strategy,
            frames,
        };
        info!(count = extraction.frame_count, duration, ?strategy, "extracted frames");

        if let Err(err) = write_manifest(out_dir, video, &extraction) {
            warn!(%err, "could not write frame manifest");
        }
        Ok(extraction)
    }

    async fn run_ffmpeg(&self, video: &Path, out_dir: &Path, filter: &[&str]) -> Result<(), ExtractError> {
        let spec = CommandSpec::new(&self.ffmpeg)
            .args(["-y", "-v", "error", "-i"])
            .arg(video.display().to_string())
            .args(filter.iter().copied())
            .arg(out_dir.join(FRAME_PATTERN).display().to_string());

        let output = self.runner.run(&spec).await?;
        if !output.success() {
            // Partial output is still usable; the caller counts what landed on disk.
            debug!(detail = %output.failure_summary(), "ffmpeg reported an error");
        }
        Ok(())
    }

    async fn sample_every_second(&self, video: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        clear_frames(out_dir)?;
        self.run_ffmpeg(video, out_dir, &["-vf", "fps=1"]).await?;
        Ok(list_frames(out_dir)?)
    }

    async fn sample_last(&self, video: &Path, out_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        clear_frames(out_dir)?;
        self.run_ffmpeg(video, out_dir, &["-vsync", "vfr"]).await?;

        let mut frames = list_frames(out_dir)?;
        let Some(last) = frames.pop() else {
            return Ok(Vec::new());
        };
        for earlier in frames {
            fs::remove_file(&earlier)?;
        }
        Ok(vec![last])
    }
}

fn parse_duration(text: &str) -> f64 {
    text.lines()
        .find_map(|line| line.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0)
}

fn is_frame(path: &Path) -> bool {
    path.is_file()
        && path.extension().map(|e| e == "png").unwrap_or(false)
        && path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(FRAME_PREFIX))
            .unwrap_or(false)
}

/// Frame files in `dir`, sorted by name (which is chronological order).
pub fn list_frames(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_frame(&path) {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

fn clear_frames(dir: &Path) -> std::io::Result<()> {
    for frame in list_frames(dir)? {
        fs::remove_file(frame)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Reply, ScriptedRunner};
    use crate::config::Config;
    use tempfile::TempDir;

    /// Mimic ffmpeg writing `count` numbered frames to the pattern in the last argument.
    fn writes_frames(count: usize) -> Reply {
        Reply::ok("").with_effect(move |spec| {
            let pattern = spec.args.last().cloned().unwrap_or_default();
            for i in 1..=count {
                let path = pattern.replace("%05d", &format!("{:05}", i));
                image::RgbImage::new(4, 2).save(&path).unwrap();
            }
        })
    }

    fn setup(duration: &str, ffmpeg: Vec<Reply>) -> (ScriptedRunner, FrameExtractor, TempDir, PathBuf) {
        let runner = ScriptedRunner::new();
        runner.on("ffprobe", &[], Reply::ok(duration));
        runner.on_sequence("ffmpeg", &[], ffmpeg);
        let extractor = FrameExtractor::new(Arc::new(runner.clone()), &Config::defaults().media);

        let dir = TempDir::new().unwrap();
        let video = dir.path().join("recording.mp4");
        fs::write(&video, b"not really a video").unwrap();
        (runner, extractor, dir, video)
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5.042000\n"), 5.042);
        assert_eq!(parse_duration("N/A\n"), 0.0);
        assert_eq!(parse_duration(""), 0.0);
        assert_eq!(parse_duration("-3"), 0.0);
    }

    #[test]
    fn test_frame_pattern_sorts_chronologically() {
        let names: Vec<String> = [9, 10, 99, 100, 1000]
            .iter()
            .map(|i| format!("frame_{:05}.png", i))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn test_short_clip_keeps_last_frame() {
        let (runner, extractor, dir, video) = setup("0.4\n", vec![writes_frames(12)]);
        let out = dir.path().join("frames");

        let result = extractor.extract(&video, &out).await.unwrap();
        assert_eq!(result.frame_count, 1);
        assert_eq!(result.strategy, Strategy::LastFrame);
        assert!(result.frames[0].ends_with("frame_00012.png"));
        assert_eq!(list_frames(&out).unwrap().len(), 1);
        assert!(runner.calls()[1].args.contains(&"vfr".to_string()));
    }

    #[tokio::test]
    async fn test_long_clip_samples_each_second() {
        let (runner, extractor, dir, video) = setup("5.0\n", vec![writes_frames(5)]);
        let out = dir.path().join("frames");

        let result = extractor.extract(&video, &out).await.unwrap();
        assert_eq!(result.frame_count, 5);
        assert_eq!(result.strategy, Strategy::EverySecond);
        assert!(runner.calls()[1].args.contains(&"fps=1".to_string()));
        assert!(out.join("frames.json").exists());
    }

    #[tokio::test]
    async fn test_failed_probe_still_yields_a_frame() {
        let (runner, extractor, dir, video) = setup("", vec![writes_frames(0), writes_frames(3)]);
        runner.on("ffprobe", &[], Reply::failed(1, "moov atom not found"));
        let out = dir.path().join("frames");

        let result = extractor.extract(&video, &out).await.unwrap();
        assert_eq!(result.duration, 0.0);
        assert_eq!(result.strategy, Strategy::Fallback);
        assert_eq!(result.frame_count, 1);
        assert!(result.frames[0].ends_with("frame_00003.png"));
    }

    #[tokio::test]
    async fn test_undecodable_video_yields_zero() {
        let (_runner, extractor, dir, video) = setup("2.0", vec![Reply::failed(1, "Invalid data")]);
        let out = dir.path().join("frames");

        let result = extractor.extract(&video, &out).await.unwrap();
        assert_eq!(result.frame_count, 0);
        assert!(result.frames.is_empty());
    }

    #[tokio::test]
    async fn test_missing_video() {
        let (_runner, extractor, dir, _video) = setup("1.0", vec![]);
        let err = extractor
            .extract(&dir.path().join("nope.mp4"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::MissingVideo(_)));
    }
}
