//! Pairing-code rendering for delivery through a chat transport.

use crate::transport::MediaAttachment;
use anyhow::{anyhow, Result};
use base64::Engine;
use image::{GrayImage, ImageFormat, Luma};
use qrcode::{Color, QrCode};
use std::io::Cursor;

/// Pixels per module
const MODULE_SCALE: u32 = 8;
/// Light border, in modules
const QUIET_ZONE: u32 = 4;

/// Encode `payload` as a QR code PNG.
pub fn render_png(payload: &str) -> Result<Vec<u8>> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let code = QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode pairing QR payload: {err}"))?;
    let width = u32::try_from(code.width()).map_err(|_| anyhow!("QR code too large"))?;
    let colors = code.to_colors();

    let side = (width + 2 * QUIET_ZONE) * MODULE_SCALE;
    let image = GrayImage::from_fn(side, side, |x, y| {
        let mx = (x / MODULE_SCALE).checked_sub(QUIET_ZONE);
        let my = (y / MODULE_SCALE).checked_sub(QUIET_ZONE);
        let dark = match (mx, my) {
            (Some(mx), Some(my)) if mx < width && my < width => {
                colors[(my * width + mx) as usize] == Color::Dark
            }
            _ => false,
        };
        Luma([if dark { 0 } else { 255 }])
    });

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| anyhow!("Failed to encode QR PNG: {err}"))?;
    Ok(png)
}

/// Pairing code as a base64 PNG attachment.
pub fn qr_attachment(payload: &str, caption: Option<String>) -> Result<MediaAttachment> {
    let png = render_png(payload)?;
    Ok(MediaAttachment {
        mime_type: "image/png".into(),
        data: base64::engine::general_purpose::STANDARD.encode(png),
        filename: Some("pairing-qr.png".into()),
        caption,
    })
}
