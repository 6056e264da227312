use crate::error::{CaptionError, CaptionResult};
use image::DynamicImage;
use std::path::Path;

/// Decode an image file, guessing the format from its content.
pub fn decode_image_file(path: impl AsRef<Path>) -> CaptionResult<DynamicImage> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let bytes = std::fs::read(path)?;
    decode_image_bytes(name, &bytes)
}

pub fn decode_image_bytes(name: impl Into<String>, bytes: &[u8]) -> CaptionResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|source| CaptionError::ImageDecode {
        name: name.into(),
        source,
    })
}
