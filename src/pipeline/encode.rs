//! Image encoding: figure bytes → base64 PNG wrapped in `ImageData`.
//!
//! LLM APIs accept images as base64 data-URIs embedded in the JSON request
//! body. Extracted figures are normalised to PNG at extraction time, so
//! encoding here is a straight base64 wrap; `detail: "high"` instructs
//! GPT-4-class models to use the full image tile budget — without it axis
//! labels and small legends are lost.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use tracing::debug;

/// Wrap PNG bytes as a base64 image attachment for the summary request.
pub fn encode_figure(png_bytes: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png_bytes);
    debug!("Encoded figure → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}

/// Decode arbitrary image bytes (PNG or JPEG) and re-encode as PNG.
///
/// Source documents link figures in whatever format the publisher used;
/// normalising to PNG keeps the storage key format honest and feeds the
/// model lossless pixels.
pub fn normalise_to_png(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
    Ok(out)
}
