use std::sync::Arc;

use bytes::Bytes;
use image::ImageFormat;

use super::frame::{Frame, FrameMetadata, PixelFormat, StreamKind};
use crate::error::CaptureError;

/// Bring a driver frame into a publishable, packed format.
///
/// Compressed and subsampled color formats become `Rgb8`; packed formats are
/// validated and passed through untouched.
pub fn normalize(frame: Frame) -> Result<Frame, CaptureError> {
    let meta = &frame.meta;
    let format_matches_stream = match meta.stream {
        StreamKind::Depth => meta.format == PixelFormat::Z16,
        StreamKind::Color => meta.format != PixelFormat::Z16,
    };
    if !format_matches_stream {
        return Err(CaptureError::InvalidFrame {
            stream: meta.stream,
            reason: format!("{:?} is not a {} format", meta.format, meta.stream),
        });
    }

    frame.validate()?;

    match meta.format {
        PixelFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(&frame.data, ImageFormat::Jpeg)?;
            let rgb = decoded.to_rgb8();
            Ok(repack(&frame, rgb.width(), rgb.height(), rgb.into_raw()))
        }
        PixelFormat::Yuyv => {
            let rgb = yuyv_to_rgb(&frame);
            Ok(repack(&frame, meta.width, meta.height, rgb))
        }
        PixelFormat::Rgb8 | PixelFormat::Bgr8 | PixelFormat::Gray8 | PixelFormat::Z16 => Ok(frame),
    }
}

fn repack(source: &Frame, width: u32, height: u32, rgb: Vec<u8>) -> Frame {
    Frame {
        data: Bytes::from(rgb),
        meta: Arc::new(FrameMetadata {
            width,
            height,
            stride: width * 3,
            format: PixelFormat::Rgb8,
            ..FrameMetadata::clone(&source.meta)
        }),
        timestamp: source.timestamp,
    }
}

/// YUYV 4:2:2 to RGB using BT.601 limited-range coefficients.
fn yuyv_to_rgb(frame: &Frame) -> Vec<u8> {
    let meta = &frame.meta;
    let mut out = Vec::with_capacity((meta.width * meta.height * 3) as usize);
    for y in 0..meta.height as usize {
        let start = y * meta.stride as usize;
        let row = &frame.data[start..start + (meta.width * 2) as usize];
        for chunk in row.chunks_exact(4) {
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            out.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
            out.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
        }
        // Odd widths leave a trailing luma sample without its pair.
        if meta.width % 2 == 1 {
            let tail = &row[row.len() - 2..];
            out.extend_from_slice(&ycbcr_to_rgb(tail[0], tail[1], 128));
        }
    }
    out
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 1.164 * (y as f32 - 16.0);
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(c + 1.596 * e),
        clamp(c - 0.392 * d - 0.813 * e),
        clamp(c + 2.017 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_gray_level_maps_to_neutral_rgb() {
        // Two pixels of mid-gray: Y=126, U=V=128.
        let frame = Frame::new(
            StreamKind::Color,
            PixelFormat::Yuyv,
            2,
            1,
            3,
            Bytes::from(vec![126, 128, 126, 128]),
        )
        .unwrap();
        let rgb = normalize(frame).unwrap();
        assert_eq!(rgb.meta.format, PixelFormat::Rgb8);
        assert_eq!(rgb.meta.sequence, 3);
        assert_eq!(rgb.data.len(), 6);
        assert!(rgb.data.iter().all(|&c| c == 128));
    }

    #[test]
    fn depth_format_on_color_stream_is_rejected() {
        let frame = Frame::new(
            StreamKind::Color,
            PixelFormat::Z16,
            1,
            1,
            1,
            Bytes::from(vec![0, 0]),
        )
        .unwrap();
        assert!(matches!(
            normalize(frame),
            Err(CaptureError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn corrupt_mjpeg_is_a_decode_error() {
        let frame = Frame::new(
            StreamKind::Color,
            PixelFormat::Mjpeg,
            4,
            4,
            1,
            Bytes::from_static(b"not a jpeg"),
        )
        .unwrap();
        assert!(matches!(normalize(frame), Err(CaptureError::Decode(_))));
    }
}
