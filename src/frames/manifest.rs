//! `frames.json` written next to extracted frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::extract::{FrameExtraction, Strategy};

/// Manifest file name inside the frames directory
pub const MANIFEST_FILE: &str = "frames.json";

/// One frame entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEntry {
    pub file: String,
    /// Pixel size, when the image header could be read
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Description of a frames directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameManifest {
    /// File name of the recording the frames came from
    pub source: String,
    pub duration: f64,
    pub strategy: Strategy,
    pub frames: Vec<FrameEntry>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
}

impl FrameManifest {
    pub fn build(video: &Path, extraction: &FrameExtraction) -> Self {
        let frames = extraction
            .frames
            .iter()
            .map(|path| {
                let dims = image::image_dimensions(path).ok();
                FrameEntry {
                    file: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    width: dims.map(|(w, _)| w),
                    height: dims.map(|(_, h)| h),
                }
            })
            .collect();

        Self {
            source: video
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            duration: extraction.duration,
            strategy: extraction.strategy,
            frames,
            created: Utc::now(),
        }
    }

    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let raw = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Write the manifest for an extraction into `dir`
pub fn write_manifest(dir: &Path, video: &Path, extraction: &FrameExtraction) -> std::io::Result<()> {
    let manifest = FrameManifest::build(video, extraction);
    fs::write(dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;
    Ok(())
}
