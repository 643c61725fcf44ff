//! Image decoding from uploads and files.

use std::path::Path;

use image::{DynamicImage, ImageFormat, ImageReader};
use leaf_core::PreprocessError;
use std::io::Cursor;
use tracing::debug;

/// Formats accepted from the upload widget
pub const ACCEPTED_FORMATS: [ImageFormat; 2] = [ImageFormat::Jpeg, ImageFormat::Png];

/// Decodes encoded image bytes, sniffing the format from the content.
pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::UnsupportedFormat("empty upload".into()));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PreprocessError::UnsupportedFormat(e.to_string()))?;

    let format = reader.format().ok_or_else(|| {
        PreprocessError::UnsupportedFormat("could not determine image format".into())
    })?;
    check_accepted(format)?;

    let image = reader.decode()?;
    debug!(
        "Decoded {:?} upload: {}x{} {:?}",
        format,
        image.width(),
        image.height(),
        image.color()
    );
    check_not_empty(image)
}

/// Decodes an image file from disk. The content decides the format, not the
/// file extension.
pub fn decode_file(path: &Path) -> Result<DynamicImage, PreprocessError> {
    let unsupported = |e: &dyn std::fmt::Display| {
        PreprocessError::UnsupportedFormat(format!("{}: {}", path.display(), e))
    };

    let reader = ImageReader::open(path)
        .map_err(|e| unsupported(&e))?
        .with_guessed_format()
        .map_err(|e| unsupported(&e))?;

    match reader.format() {
        Some(format) => check_accepted(format).map_err(|e| unsupported(&e))?,
        None => return Err(unsupported(&"could not determine image format")),
    }

    let image = reader.decode().map_err(|e| unsupported(&e))?;
    check_not_empty(image)
}

/// Whether the format is one the upload widget offers
pub fn is_accepted_format(format: ImageFormat) -> bool {
    ACCEPTED_FORMATS.contains(&format)
}

fn check_accepted(format: ImageFormat) -> Result<(), PreprocessError> {
    if !is_accepted_format(format) {
        return Err(PreprocessError::UnsupportedFormat(format!(
            "{:?} images are not accepted, upload a JPEG or PNG",
            format
        )));
    }
    Ok(())
}

fn check_not_empty(image: DynamicImage) -> Result<DynamicImage, PreprocessError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::UnsupportedFormat(format!(
            "image has no pixels ({}x{})",
            image.width(),
            image.height()
        )));
    }
    Ok(image)
}
