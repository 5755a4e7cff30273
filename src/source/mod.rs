//! Image sources.
//!
//! A source watches some location for frames and hands the newest one to the
//! coordinator at most once per update. Sources are responsible for:
//! - Tracking the most recently modified candidate file
//! - Enforcing the configured minimum delivery interval
//! - Decoding frames into RGB8 regardless of container format
//!
//! Decode failures are logged and reported as "no frame"; they never abort
//! the calling loop.

mod folder;

pub use folder::{FolderConfig, FolderSource};

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;

use crate::frame::Frame;

/// File extensions recognized as frames, matched case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif"];

/// Returns true when the path carries a recognized image extension.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Metadata describing a source and its current frame.
#[derive(Clone, Debug, Default)]
pub struct SourceMetadata {
    /// Logical source name from configuration.
    pub name: String,
    /// Source kind tag (e.g. "folder").
    pub kind: &'static str,
    pub file_path: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub modified_at: Option<SystemTime>,
    pub last_delivered_at: Option<SystemTime>,
}

/// Contract implemented by every image source variant.
pub trait ImageSource: Send {
    /// Logical source name from configuration.
    fn name(&self) -> &str;

    /// Source kind tag.
    fn kind(&self) -> &'static str;

    fn is_enabled(&self) -> bool;

    /// Begin observing. Performs an initial synchronous scan to seed the
    /// latest-frame pointer, then watches for changes asynchronously.
    fn start(&mut self) -> Result<()>;

    /// Cease observation and release watch resources. Safe to call even if
    /// the source was never started.
    fn stop(&mut self);

    /// True iff the backing location currently exists and is usable.
    fn is_available(&self) -> bool;

    /// The latest undelivered frame, if one exists and the configured
    /// minimum interval since the previous delivery has elapsed.
    fn latest_frame(&mut self) -> Option<Frame>;

    fn metadata(&self) -> SourceMetadata;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_image_extensions_case_insensitively() {
        assert!(is_image_file(Path::new("/tmp/a.jpg")));
        assert!(is_image_file(Path::new("/tmp/a.JPEG")));
        assert!(is_image_file(Path::new("/tmp/a.Tif")));
        assert!(!is_image_file(Path::new("/tmp/a.txt")));
        assert!(!is_image_file(Path::new("/tmp/noext")));
    }
}
