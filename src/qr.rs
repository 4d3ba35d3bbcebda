//! Rendering of pairing challenges as PNG, SVG, or terminal blocks.

use std::io::Cursor;

use qrcode::render::{svg, unicode};
use qrcode::QrCode;

/// Minimum edge length of rendered images, in pixels.
const MIN_DIMENSION: u32 = 300;

/// Errors from QR rendering.
#[derive(Debug, thiserror::Error)]
pub enum QrRenderError {
    /// The challenge did not fit in a QR code.
    #[error("QR encoding failed: {0}")]
    Encode(#[from] qrcode::types::QrError),

    /// PNG serialization failed.
    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

/// Render the challenge as a PNG image.
///
/// # Errors
///
/// Returns [`QrRenderError`] if the data cannot be encoded.
pub fn render_png(data: &str) -> Result<Vec<u8>, QrRenderError> {
    let code = QrCode::new(data.as_bytes())?;
    let image = code
        .render::<image::Luma<u8>>()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .build();

    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, image::ImageFormat::Png)?;
    Ok(buf.into_inner())
}

/// Render the challenge as an SVG document.
///
/// # Errors
///
/// Returns [`QrRenderError::Encode`] if the data cannot be encoded.
pub fn render_svg(data: &str) -> Result<String, QrRenderError> {
    let code = QrCode::new(data.as_bytes())?;
    Ok(code
        .render::<svg::Color<'_>>()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

/// Render the challenge with Unicode half blocks for a terminal.
///
/// # Errors
///
/// Returns [`QrRenderError::Encode`] if the data cannot be encoded.
pub fn render_terminal(data: &str) -> Result<String, QrRenderError> {
    let code = QrCode::new(data.as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}
