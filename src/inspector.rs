use image::{ImageFormat, ImageReader};
use std::path::Path;
use tracing::debug;

/// Header-level facts about a local image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub mime: &'static str,
    pub format: ImageFormat,
}

/// Reads dimensions and format from the file header without decoding pixels.
pub fn inspect(path: &Path) -> Option<ImageInfo> {
    let reader = match ImageReader::open(path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => reader,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "cannot open image for probing");
            return None;
        }
    };
    let format = reader.format()?;
    let (width, height) = match reader.into_dimensions() {
        Ok(dims) => dims,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "image header probe failed");
            return None;
        }
    };
    if width == 0 || height == 0 {
        return None;
    }
    Some(ImageInfo {
        width,
        height,
        mime: mime_type_for_format(format),
        format,
    })
}

pub fn mime_type_for_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Png => "image/png",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        ImageFormat::WebP => "image/webp",
        _ => "application/octet-stream",
    }
}
