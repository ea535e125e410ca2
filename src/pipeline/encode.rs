//! Image encoding: segment `DynamicImage` → base64 PNG.
//!
//! Both backends take images as base64 inside a JSON body: Ollama as a bare
//! string in `images`, hosted providers as an `ImageData` data-URI. PNG keeps
//! glyph edges crisp; JPEG ringing around small text measurably hurts
//! transcription.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// A PNG-encoded segment, ready to be attached to a request.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub base64: String,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    /// Wrap for an `edgequake-llm` provider. `detail: "high"` keeps OpenAI
    /// from collapsing the strip to a single 512 px tile.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.base64.clone(), "image/png").with_detail("high")
    }
}

/// Encode a segment image as base64 PNG.
pub fn encode_segment(img: &DynamicImage) -> Result<EncodedImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} segment → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(EncodedImage {
        base64: b64,
        width: img.width(),
        height: img.height(),
    })
}
