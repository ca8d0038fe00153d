//! Diagnostic artifact capture: logcat, bugreports, screenshots.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::warn;

use crate::harness::device::ManagedDevice;
use crate::harness::error::{DeviceError, TransportError};

/// Screenshots whose short edge exceeds this are halved before storage.
const DOWNSAMPLE_SHORT_EDGE: u32 = 720;
const SCREENSHOT_REMOTE_PATH: &str = "/data/local/tmp/screenshot.png";
const RAW_IMAGE_BPP: usize = 4;

impl ManagedDevice {
    /// Dump the current log buffer, capped at the configured byte budget
    /// (oldest lines are dropped first).
    pub fn capture_logcat(&self) -> Result<Vec<u8>, DeviceError> {
        let output = self.execute_adb_command(
            &["logcat", "-d"],
            Duration::from_millis(self.options().timeouts.command_timeout_ms),
        )?;
        Ok(truncate_to_tail(
            output.into_bytes(),
            self.options().artifacts.max_log_data_bytes as usize,
        ))
    }

    /// Capture a bugreport with zero retries: a dump takes minutes, so a
    /// partial capture beats restarting from scratch. Whatever came back
    /// before a failure is returned, possibly nothing.
    pub fn capture_bugreport(&self) -> Result<Vec<u8>, DeviceError> {
        let timeout = Duration::from_millis(self.options().timeouts.long_command_timeout_ms);
        let slot = std::sync::Arc::clone(self.transport_slot());
        let mut output: Option<String> = None;
        let mut action = || -> Result<bool, TransportError> {
            let transport = slot.current();
            output = Some(transport.shell("bugreport", timeout)?);
            Ok(true)
        };
        if !self.perform_device_action_with_retries("bugreport", &mut action, 0)? {
            warn!(serial = %self.serial(), "bugreport did not complete, keeping partial output");
        }
        Ok(truncate_to_tail(
            output.unwrap_or_default().into_bytes(),
            self.options().artifacts.max_log_data_bytes as usize,
        ))
    }

    /// Take a PNG screenshot into `local_path` via a staging file on the
    /// device.
    pub fn capture_screenshot(&self, local_path: &Path) -> Result<bool, DeviceError> {
        self.execute_shell_command(&format!("screencap -p {SCREENSHOT_REMOTE_PATH}"))?;
        let pulled = self.pull_file(SCREENSHOT_REMOTE_PATH, local_path)?;
        self.execute_shell_command(&format!("rm -f {SCREENSHOT_REMOTE_PATH}"))?;
        Ok(pulled)
    }
}

/// Keep at most `max_bytes` from the end of a capture; the most recent lines
/// are the diagnostic ones.
pub fn truncate_to_tail(mut bytes: Vec<u8>, max_bytes: usize) -> Vec<u8> {
    if bytes.len() > max_bytes {
        bytes.drain(..bytes.len() - max_bytes);
    }
    bytes
}

/// Decoded framebuffer dump from raw `screencap` output (RGBA, 4 bytes per
/// pixel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Parse raw `screencap` output. The header is three (older builds) or four
/// (newer builds) little-endian u32 fields starting with width and height;
/// anything that does not account for every pixel byte is rejected.
pub fn parse_raw_screencap(bytes: &[u8]) -> Option<RawImage> {
    if bytes.len() < 12 {
        return None;
    }
    let width = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let height = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
    let pixel_bytes = (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(RAW_IMAGE_BPP)?;
    let header_len = bytes.len().checked_sub(pixel_bytes)?;
    if header_len != 12 && header_len != 16 {
        return None;
    }
    Some(RawImage {
        width,
        height,
        pixels: bytes[header_len..].to_vec(),
    })
}

/// Halve an image by skip-sampling every other pixel and row.
pub fn downsample_by_half(image: &RawImage) -> RawImage {
    let width = image.width / 2;
    let height = image.height / 2;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * RAW_IMAGE_BPP);
    let stride = image.width as usize * RAW_IMAGE_BPP;
    for y in 0..height as usize {
        for x in 0..width as usize {
            let offset = 2 * y * stride + 2 * x * RAW_IMAGE_BPP;
            pixels.extend_from_slice(&image.pixels[offset..offset + RAW_IMAGE_BPP]);
        }
    }
    RawImage {
        width,
        height,
        pixels,
    }
}

/// Shrink oversized captures; screens up to the threshold pass through
/// untouched.
pub fn normalize_screenshot(image: RawImage) -> RawImage {
    if image.width.min(image.height) > DOWNSAMPLE_SHORT_EDGE {
        downsample_by_half(&image)
    } else {
        image
    }
}

/// Render PNG bytes as a `data:` URL for embedding in reports.
pub fn png_data_url(png_bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64.encode(png_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::harness::config::HarnessOptions;
    use crate::harness::models::{DeviceHandle, DeviceKind};
    use crate::harness::testkit::{ScriptedBootloader, ScriptedTransport};

    fn raw_bytes(width: u32, height: u32, header_len: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&width.to_le_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        if header_len == 16 {
            bytes.extend_from_slice(&0u32.to_le_bytes());
        }
        for index in 0..(width * height * RAW_IMAGE_BPP as u32) {
            bytes.push(index as u8);
        }
        bytes
    }

    #[test]
    fn truncation_keeps_the_tail() {
        let bytes = b"aaaabbbb".to_vec();
        assert_eq!(truncate_to_tail(bytes.clone(), 4), b"bbbb".to_vec());
        assert_eq!(truncate_to_tail(bytes.clone(), 100), bytes);
    }

    #[test]
    fn raw_screencap_parses_both_header_lengths() {
        for header_len in [12usize, 16] {
            let image = parse_raw_screencap(&raw_bytes(2, 3, header_len)).expect("parse");
            assert_eq!(image.width, 2);
            assert_eq!(image.height, 3);
            assert_eq!(image.pixels.len(), 2 * 3 * RAW_IMAGE_BPP);
        }
    }

    #[test]
    fn raw_screencap_rejects_short_payloads() {
        let mut bytes = raw_bytes(2, 2, 12);
        bytes.truncate(bytes.len() - 1);
        assert_eq!(parse_raw_screencap(&bytes), None);
        assert_eq!(parse_raw_screencap(&[0u8; 5]), None);
    }

    #[test]
    fn oversized_screenshots_are_halved() {
        let large = parse_raw_screencap(&raw_bytes(40, 8, 12)).expect("parse");
        // Short edge below the threshold: untouched.
        assert_eq!(normalize_screenshot(large.clone()), large);

        let image = RawImage {
            width: 1600,
            height: 800,
            pixels: vec![0u8; 1600 * 800 * RAW_IMAGE_BPP],
        };
        let shrunk = normalize_screenshot(image);
        assert_eq!((shrunk.width, shrunk.height), (800, 400));
        assert_eq!(shrunk.pixels.len(), 800 * 400 * RAW_IMAGE_BPP);
    }

    #[test]
    fn downsample_skip_samples_pixels() {
        let image = parse_raw_screencap(&raw_bytes(4, 2, 12)).expect("parse");
        let half = downsample_by_half(&image);
        assert_eq!((half.width, half.height), (2, 1));
        // First pixel of the source survives verbatim.
        assert_eq!(half.pixels[..4], image.pixels[..4]);
        // Second output pixel is the source pixel at x=2.
        assert_eq!(half.pixels[4..8], image.pixels[8..12]);
    }

    #[test]
    fn data_url_has_png_prefix() {
        let url = png_data_url(b"\x89PNG");
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn logcat_capture_is_capped() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_adb("logcat -d", &"x".repeat(200_000));
        let mut options = HarnessOptions::default();
        options.artifacts.max_log_data_bytes = 1024;
        let device = ManagedDevice::with_channels(
            DeviceHandle::new("TEST-1", DeviceKind::Native),
            options,
            transport,
            ScriptedBootloader::new("TEST-1"),
            None,
        );
        assert_eq!(device.capture_logcat().expect("logcat").len(), 1024);
    }

    #[test]
    fn screenshot_stages_pulls_and_cleans_up() {
        let transport = ScriptedTransport::new("TEST-1");
        let device = ManagedDevice::with_channels(
            DeviceHandle::new("TEST-1", DeviceKind::Native),
            HarnessOptions::default(),
            transport.clone(),
            ScriptedBootloader::new("TEST-1"),
            None,
        );
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(device
            .capture_screenshot(&dir.path().join("shot.png"))
            .expect("screenshot"));
        let calls = transport.calls();
        assert!(calls[0].contains("screencap -p"));
        assert!(calls[1].starts_with("pull /data/local/tmp/screenshot.png"));
        assert!(calls[2].contains("rm -f /data/local/tmp/screenshot.png"));
    }
}
