pub mod extract;
pub mod manifest;

pub use extract::{ExtractError, FRAME_PATTERN, FrameExtraction, FrameExtractor, Strategy, list_frames};
pub use manifest::{FrameEntry, FrameManifest, MANIFEST_FILE, write_manifest};
