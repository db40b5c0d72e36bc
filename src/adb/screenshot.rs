//! Screenshot capture for the agent loop.

use std::io::Cursor;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, RgbImage};

use super::device::AdbDevice;
use crate::agent::{CaptureError, ScreenCapture, Screenshot};

const PNG_MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
const FALLBACK_WIDTH: u32 = 1080;
const FALLBACK_HEIGHT: u32 = 2400;

/// stderr fragments meaning the device itself is gone.
const DEVICE_LOST: [&str; 4] = [
    "device not found",
    "no devices",
    "device offline",
    "unauthorized",
];

#[async_trait]
impl ScreenCapture for AdbDevice {
    /// Uses `adb exec-out screencap -p` so the image never touches disk.
    ///
    /// Screens that refuse capture (payment pages and the like) come back as
    /// a black image with `is_sensitive` set. Only a missing device fails.
    async fn capture(&self) -> Result<Screenshot, CaptureError> {
        let output = self
            .run(&["exec-out", "screencap", "-p"])
            .await
            .map_err(|e| CaptureError::new(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if let Some(reason) = DEVICE_LOST.iter().find(|m| stderr.contains(*m)) {
            return Err(CaptureError::new(*reason));
        }

        let current_app = self.current_package().await;

        if stderr.contains("status: -1") || stderr.contains("failed") || stderr.contains("error") {
            tracing::warn!("Screenshot refused (sensitive screen): {}", stderr.trim());
            return Ok(fallback_screenshot(true, current_app));
        }

        Ok(match decode_png(&output.stdout) {
            Some((width, height)) => Screenshot {
                base64_data: STANDARD.encode(&output.stdout),
                width,
                height,
                is_sensitive: false,
                current_app,
            },
            None => fallback_screenshot(false, current_app),
        })
    }
}

/// Dimensions of a valid PNG.
fn decode_png(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < PNG_MAGIC.len() || &data[..PNG_MAGIC.len()] != PNG_MAGIC {
        tracing::error!("Invalid screenshot data ({} bytes)", data.len());
        return None;
    }
    match image::load_from_memory(data) {
        Ok(img) => Some((img.width(), img.height())),
        Err(e) => {
            tracing::error!("Failed to parse screenshot image: {}", e);
            None
        }
    }
}

/// Black image standing in for a screen that could not be captured.
fn fallback_screenshot(is_sensitive: bool, current_app: Option<String>) -> Screenshot {
    let black = RgbImage::new(FALLBACK_WIDTH, FALLBACK_HEIGHT);
    let mut buffer = Cursor::new(Vec::new());
    if let Err(e) = DynamicImage::ImageRgb8(black).write_to(&mut buffer, image::ImageFormat::Png) {
        tracing::error!("Failed to encode fallback screenshot: {}", e);
    }

    Screenshot {
        base64_data: STANDARD.encode(buffer.into_inner()),
        width: FALLBACK_WIDTH,
        height: FALLBACK_HEIGHT,
        is_sensitive,
        current_app,
    }
}
