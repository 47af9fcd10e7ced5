use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::{GrayImage, ImageBuffer, Luma, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Which stream of the camera a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Color,
    Depth,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Color, StreamKind::Depth];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame data. Once published, a frame is never mutated, only replaced.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel payload
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Capture order within the stream, strictly increasing
    pub sequence: u64,
    pub stream: StreamKind,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb8,
    Bgr8,
    Gray8,
    Yuyv,
    Mjpeg,
    /// 16-bit little-endian depth units
    Z16,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => Some(3),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Yuyv | PixelFormat::Z16 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }
}

/// Stream geometry, fixed when the source is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Frame {
    /// Build a packed frame, checking the payload matches the geometry.
    pub fn new(
        stream: StreamKind,
        format: PixelFormat,
        width: u32,
        height: u32,
        sequence: u64,
        data: Bytes,
    ) -> Result<Self, CaptureError> {
        let stride = width * format.bytes_per_pixel().unwrap_or(0);
        let frame = Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                stream,
                width,
                height,
                stride,
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn stream(&self) -> StreamKind {
        self.meta.stream
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    /// Check the payload length against width, height and stride.
    pub fn validate(&self) -> Result<(), CaptureError> {
        let meta = &self.meta;
        let Some(bpp) = meta.format.bytes_per_pixel() else {
            if self.data.is_empty() {
                return Err(self.invalid("empty compressed payload".into()));
            }
            return Ok(());
        };
        if meta.width == 0 || meta.height == 0 {
            return Err(self.invalid(format!("zero-sized frame {}x{}", meta.width, meta.height)));
        }
        if meta.stride < meta.width * bpp {
            return Err(self.invalid(format!(
                "stride {} too small for width {}",
                meta.stride, meta.width
            )));
        }
        let expected = meta.stride as usize * meta.height as usize;
        if self.data.len() < expected {
            return Err(self.invalid(format!(
                "payload is {} bytes, expected {}",
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> CaptureError {
        CaptureError::InvalidFrame {
            stream: self.meta.stream,
            reason,
        }
    }

    /// An independent copy whose payload shares nothing with `self`.
    pub fn deep_copy(&self) -> Frame {
        Frame {
            data: Bytes::copy_from_slice(&self.data),
            meta: Arc::new(FrameMetadata::clone(&self.meta)),
            timestamp: self.timestamp,
        }
    }

    fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.meta.stride as usize;
        &self.data[start..start + self.meta.stride as usize]
    }

    /// Luma view of a color frame (ITU-R BT.601 weights).
    pub fn to_gray(&self) -> Option<GrayImage> {
        let (w, h) = (self.meta.width, self.meta.height);
        let (ri, bi) = match self.meta.format {
            PixelFormat::Rgb8 => (0, 2),
            PixelFormat::Bgr8 => (2, 0),
            PixelFormat::Gray8 => {
                let mut out = Vec::with_capacity((w * h) as usize);
                for y in 0..h {
                    out.extend_from_slice(&self.row(y)[..w as usize]);
                }
                return GrayImage::from_raw(w, h, out);
            }
            _ => return None,
        };
        let mut out = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for px in self.row(y)[..(w * 3) as usize].chunks_exact(3) {
                let luma = 0.299 * px[ri] as f32 + 0.587 * px[1] as f32 + 0.114 * px[bi] as f32;
                out.push(luma.round().clamp(0.0, 255.0) as u8);
            }
        }
        GrayImage::from_raw(w, h, out)
    }

    /// RGB view of a color frame, used for export.
    pub fn to_rgb(&self) -> Option<RgbImage> {
        let (w, h) = (self.meta.width, self.meta.height);
        let swap = match self.meta.format {
            PixelFormat::Rgb8 => false,
            PixelFormat::Bgr8 => true,
            _ => return None,
        };
        let mut out = Vec::with_capacity((w * h * 3) as usize);
        for y in 0..h {
            for px in self.row(y)[..(w * 3) as usize].chunks_exact(3) {
                if swap {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                } else {
                    out.extend_from_slice(px);
                }
            }
        }
        RgbImage::from_raw(w, h, out)
    }

    /// Raw depth units at a pixel of a Z16 frame.
    pub fn depth_at(&self, x: u32, y: u32) -> Option<u16> {
        if self.meta.format != PixelFormat::Z16 || x >= self.meta.width || y >= self.meta.height {
            return None;
        }
        let offset = (x * 2) as usize;
        let row = self.row(y);
        Some(u16::from_le_bytes([row[offset], row[offset + 1]]))
    }

    /// 16-bit grayscale view of a Z16 frame, used for export.
    pub fn to_depth_image(&self) -> Option<ImageBuffer<Luma<u16>, Vec<u16>>> {
        if self.meta.format != PixelFormat::Z16 {
            return None;
        }
        let (w, h) = (self.meta.width, self.meta.height);
        let mut out = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for px in self.row(y)[..(w * 2) as usize].chunks_exact(2) {
                out.push(u16::from_le_bytes([px[0], px[1]]));
            }
        }
        ImageBuffer::from_raw(w, h, out)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream", &self.meta.stream)
            .field("sequence", &self.meta.sequence)
            .field("size", &(self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_payload() {
        let err = Frame::new(
            StreamKind::Color,
            PixelFormat::Bgr8,
            4,
            4,
            1,
            Bytes::from(vec![0u8; 10]),
        )
        .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidFrame { stream: StreamKind::Color, .. }));
    }

    #[test]
    fn bgr_to_gray_uses_red_channel_weight() {
        // One pure-red pixel in BGR order.
        let frame = Frame::new(
            StreamKind::Color,
            PixelFormat::Bgr8,
            1,
            1,
            1,
            Bytes::from(vec![0u8, 0, 255]),
        )
        .unwrap();
        let gray = frame.to_gray().unwrap();
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
    }

    #[test]
    fn deep_copy_does_not_share_payload() {
        let frame = Frame::new(
            StreamKind::Depth,
            PixelFormat::Z16,
            2,
            1,
            7,
            Bytes::from(vec![0x10, 0x00, 0xff, 0x01]),
        )
        .unwrap();
        let copy = frame.deep_copy();
        assert_ne!(copy.data.as_ptr(), frame.data.as_ptr());
        assert_eq!(copy.sequence(), 7);
        assert_eq!(copy.depth_at(1, 0), Some(0x01ff));
        assert_eq!(copy.depth_at(2, 0), None);
    }
}
