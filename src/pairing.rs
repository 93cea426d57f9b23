//! Rendering of pairing challenges as QR codes.

use anyhow::{Result, anyhow};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;

/// Minimum edge of the PNG, in pixels.
const PNG_MIN_SIZE: u32 = 264;

fn encode(challenge: &str) -> Result<QrCode> {
    let payload = challenge.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }
    QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode pairing QR payload: {err}"))
}

/// Render for a terminal, two modules per character cell.
pub fn render_terminal(challenge: &str) -> Result<String> {
    Ok(encode(challenge)?
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

/// Render as a PNG image.
pub fn render_png(challenge: &str) -> Result<Vec<u8>> {
    let pixels = encode(challenge)?
        .render::<Luma<u8>>()
        .min_dimensions(PNG_MIN_SIZE, PNG_MIN_SIZE)
        .build();

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(pixels)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| anyhow!("Failed to encode pairing QR as PNG: {err}"))?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_render_is_multiline() {
        let rendered = render_terminal("2@abc,def,ghi").unwrap();
        assert!(rendered.lines().count() > 10);
    }

    #[test]
    fn png_render_has_png_signature_and_size() {
        let png = render_png("2@abc,def,ghi").unwrap();
        assert!(png.starts_with(b"\x89PNG\r\n\x1a\n"));

        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert!(decoded.width() >= PNG_MIN_SIZE);
        assert_eq!(decoded.width(), decoded.height());
    }

    #[test]
    fn blank_payload_is_rejected() {
        assert!(render_png("   ").is_err());
        assert!(render_terminal("").is_err());
    }
}
