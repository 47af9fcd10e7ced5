use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::capture::{Frame, StreamKind};
use crate::error::ExportError;

/// File name for the frame with capture sequence `sequence`.
pub fn frame_file_name(sequence: u64) -> String {
    format!("{sequence:07}.png")
}

/// Path the depth companion of `color_path` is written to.
pub fn depth_path_for(color_path: &Path) -> PathBuf {
    let stem = color_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    color_path.with_file_name(format!("{stem}_depth.png"))
}

/// Write `color` as a PNG at `path` and, if given, the raw 16-bit depth
/// next to it as `<stem>_depth.png`.
pub fn save_frame(color: &Frame, depth: Option<&Frame>, path: &Path) -> Result<(), ExportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ExportError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let rgb = color
        .to_rgb()
        .map(image::DynamicImage::ImageRgb8)
        .or_else(|| color.to_gray().map(image::DynamicImage::ImageLuma8))
        .ok_or(ExportError::Unsupported(StreamKind::Color))?;
    rgb.save_with_format(path, image::ImageFormat::Png)?;

    if let Some(depth) = depth {
        let depth_img = depth
            .to_depth_image()
            .ok_or(ExportError::Unsupported(StreamKind::Depth))?;
        let depth_path = depth_path_for(path);
        depth_img.save_with_format(&depth_path, image::ImageFormat::Png)?;
        debug!(path = %depth_path.display(), "Saved depth frame");
    }
    debug!(path = %path.display(), sequence = color.sequence(), "Saved color frame");
    Ok(())
}
