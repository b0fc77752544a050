use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};

/// JPEG quality used for all stage/tap frame encoding.
pub const JPEG_QUALITY: u8 = 85;

/// Frame representation at different pipeline stages.
///
/// Detection operates on `Gray8`; capture devices and overlays usually
/// produce `Rgb8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Gray8 {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
    Rgb8 {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
}

impl Frame {
    pub fn width(&self) -> u32 {
        match self {
            Frame::Gray8 { width, .. } | Frame::Rgb8 { width, .. } => *width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Frame::Gray8 { height, .. } | Frame::Rgb8 { height, .. } => *height,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Frame::Gray8 { data, .. } | Frame::Rgb8 { data, .. } => data.is_empty(),
        }
    }

    /// Single-channel view of the frame, converting from RGB when needed.
    pub fn to_gray(&self) -> Frame {
        match self {
            Frame::Gray8 { .. } => self.clone(),
            Frame::Rgb8 {
                data,
                width,
                height,
            } => {
                let gray = data
                    .chunks_exact(3)
                    .map(|px| {
                        let luma =
                            299 * u32::from(px[0]) + 587 * u32::from(px[1]) + 114 * u32::from(px[2]);
                        (luma / 1000) as u8
                    })
                    .collect();
                Frame::Gray8 {
                    data: gray,
                    width: *width,
                    height: *height,
                }
            }
        }
    }

    /// Three-channel view of the frame, replicating luma when needed.
    pub fn to_rgb(&self) -> Frame {
        match self {
            Frame::Rgb8 { .. } => self.clone(),
            Frame::Gray8 {
                data,
                width,
                height,
            } => {
                let mut rgb = Vec::with_capacity(data.len() * 3);
                for &value in data {
                    rgb.extend_from_slice(&[value, value, value]);
                }
                Frame::Rgb8 {
                    data: rgb,
                    width: *width,
                    height: *height,
                }
            }
        }
    }

    /// Encode the frame to JPEG bytes.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        if self.is_empty() {
            bail!("cannot encode an empty frame");
        }

        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
        let (data, color) = match self {
            Frame::Gray8 { data, .. } => (data, ExtendedColorType::L8),
            Frame::Rgb8 { data, .. } => (data, ExtendedColorType::Rgb8),
        };
        encoder
            .encode(data, self.width(), self.height(), color)
            .context("JPEG encode failed")?;
        Ok(buffer)
    }
}

/// A detected fiducial tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub tag_id: u32,
    pub corners: [[f64; 2]; 4],
    pub center: [f64; 2],
    pub family: String,
}

/// A named pipeline-stage output with a lazily encoded JPEG form.
///
/// The encoded bytes are computed on first request and memoized so repeated
/// viewers never re-encode the same frame.
pub struct StageFrame {
    pub stage: String,
    pub frame: Arc<Frame>,
    pub captured_at: DateTime<Utc>,
    jpeg: OnceLock<Arc<[u8]>>,
}

impl StageFrame {
    pub fn new(stage: impl Into<String>, frame: Arc<Frame>) -> Self {
        Self {
            stage: stage.into(),
            frame,
            captured_at: Utc::now(),
            jpeg: OnceLock::new(),
        }
    }

    /// JPEG bytes for this frame, encoded once and cached.
    pub fn jpeg_bytes(&self) -> Result<Arc<[u8]>> {
        if let Some(bytes) = self.jpeg.get() {
            return Ok(bytes.clone());
        }

        let encoded: Arc<[u8]> = self.frame.encode_jpeg()?.into();
        let _ = self.jpeg.set(encoded.clone());
        Ok(self.jpeg.get().cloned().unwrap_or(encoded))
    }

    pub fn is_encoded(&self) -> bool {
        self.jpeg.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_rgb(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x * 8) as u8, (y * 8) as u8, 128]);
            }
        }
        Frame::Rgb8 {
            data,
            width,
            height,
        }
    }

    #[test]
    fn test_gray_conversion_preserves_dimensions() {
        let frame = gradient_rgb(8, 4);
        let gray = frame.to_gray();
        assert_eq!(gray.width(), 8);
        assert_eq!(gray.height(), 4);
        match gray {
            Frame::Gray8 { data, .. } => assert_eq!(data.len(), 32),
            _ => panic!("expected Gray8"),
        }
    }

    #[test]
    fn test_gray_to_rgb_replicates_channels() {
        let gray = Frame::Gray8 {
            data: vec![7, 130],
            width: 2,
            height: 1,
        };
        match gray.to_rgb() {
            Frame::Rgb8 { data, .. } => assert_eq!(data, vec![7, 7, 7, 130, 130, 130]),
            _ => panic!("expected Rgb8"),
        }
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg_magic() {
        let frame = gradient_rgb(16, 16);
        let jpeg = frame.encode_jpeg().expect("encode should succeed");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "missing JPEG SOI marker");
    }

    #[test]
    fn test_encode_empty_frame_fails() {
        let frame = Frame::Gray8 {
            data: Vec::new(),
            width: 0,
            height: 0,
        };
        assert!(frame.encode_jpeg().is_err());
    }

    #[test]
    fn test_stage_frame_encodes_once_and_caches() {
        let stage_frame = StageFrame::new("raw", Arc::new(gradient_rgb(8, 8)));
        assert!(!stage_frame.is_encoded());

        let first = stage_frame.jpeg_bytes().expect("encode should succeed");
        assert!(stage_frame.is_encoded());

        let second = stage_frame.jpeg_bytes().expect("cached fetch should succeed");
        assert!(Arc::ptr_eq(&first, &second), "encoded bytes should be memoized");
    }
}
