//! Software frame source rendering a checkerboard at a known pose

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GrayImage};
use nalgebra::{Matrix3, Point2, Vector3};
use tracing::{debug, info};

use super::frame::{Frame, PixelFormat, Resolution, StreamKind};
use super::source::{FramePair, FrameSource, SourceIntrinsics, StreamHandle};
use crate::calibration::{CalibrationTarget, ExtrinsicParameters, IntrinsicParameters};
use crate::calibration::rodrigues::rotation_from_vector;
use crate::error::CaptureError;
use crate::CaptureConfig;

const SUPERSAMPLE: u32 = 4;
const DARK: f64 = 20.0;
const LIGHT: f64 = 235.0;
const BACKGROUND: f64 = 250.0;

/// Meters per depth unit reported by the synthetic camera.
pub const DEPTH_SCALE: f32 = 0.001;

/// The world the synthetic camera looks at: one checkerboard on a wall.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub target: CalibrationTarget,
    /// World-to-camera rotation vector
    pub rotation: Vector3<f64>,
    /// World-to-camera translation in meters
    pub translation: Vector3<f64>,
}

impl Default for SyntheticScene {
    fn default() -> Self {
        // 6x9 board about half a meter away, centered and slightly tilted.
        let target = CalibrationTarget {
            cols: 6,
            rows: 9,
            square_size: 0.0253,
        };
        let rotation = Vector3::new(0.12, -0.16, 0.04);
        let center = Vector3::new(
            0.5 * (target.cols - 1) as f64 * target.square_size,
            0.5 * (target.rows - 1) as f64 * target.square_size,
            0.0,
        );
        let translation = Vector3::new(0.0, 0.0, 0.5) - rotation_from_vector(&rotation) * center;
        Self {
            target,
            rotation,
            translation,
        }
    }
}

impl SyntheticScene {
    /// The ground-truth pose frames are rendered with.
    pub fn extrinsics(&self) -> ExtrinsicParameters {
        ExtrinsicParameters::new(rotation_from_vector(&self.rotation), self.translation)
    }

    /// Pinhole constants reported for a stream of the given size.
    pub fn intrinsics_for(width: u32, height: u32) -> SourceIntrinsics {
        let f = 0.96 * width as f64;
        SourceIntrinsics {
            width,
            height,
            fx: f,
            fy: f,
            ppx: (width as f64 - 1.0) / 2.0,
            ppy: (height as f64 - 1.0) / 2.0,
            coeffs: [0.0; 5],
        }
    }
}

/// Intersect the viewing ray of `pixel` with the target plane.
/// Returns (camera-frame depth, world x, world y).
fn trace(
    intrinsics: &IntrinsicParameters,
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    pixel: &Point2<f64>,
) -> Option<(f64, f64, f64)> {
    let n = intrinsics.normalize(pixel);
    let ray = Vector3::new(n.x, n.y, 1.0);
    let normal = r.column(2).into_owned();
    let denom = normal.dot(&ray);
    if denom.abs() < 1e-12 {
        return None;
    }
    let s = normal.dot(t) / denom;
    if s <= 0.0 {
        return None;
    }
    let world = r.transpose() * (ray * s - t);
    Some((s, world.x, world.y))
}

/// Render the target as seen through `intrinsics` at pose (R, T), with
/// box-filtered supersampling for anti-aliased edges.
pub fn render_target(
    intrinsics: &IntrinsicParameters,
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    target: &CalibrationTarget,
    width: u32,
    height: u32,
) -> GrayImage {
    let sq = target.square_size;
    let (min_x, max_x) = (-sq, target.cols as f64 * sq);
    let (min_y, max_y) = (-sq, target.rows as f64 * sq);
    let shade = |pixel: Point2<f64>| -> f64 {
        match trace(intrinsics, r, t, &pixel) {
            Some((_, x, y)) if x >= min_x && x < max_x && y >= min_y && y < max_y => {
                let ix = ((x - min_x) / sq).floor() as i64;
                let iy = ((y - min_y) / sq).floor() as i64;
                if (ix + iy) % 2 == 0 {
                    DARK
                } else {
                    LIGHT
                }
            }
            _ => BACKGROUND,
        }
    };

    let step = 1.0 / SUPERSAMPLE as f64;
    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..SUPERSAMPLE {
            for sx in 0..SUPERSAMPLE {
                let px = x as f64 - 0.5 + (sx as f64 + 0.5) * step;
                let py = y as f64 - 0.5 + (sy as f64 + 0.5) * step;
                acc += shade(Point2::new(px, py));
            }
        }
        let mean = acc / (SUPERSAMPLE * SUPERSAMPLE) as f64;
        image::Luma([mean.round().clamp(0.0, 255.0) as u8])
    })
}

/// Depth units of the target plane at every pixel; 0 where the ray misses.
pub fn render_depth(
    intrinsics: &IntrinsicParameters,
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    width: u32,
    height: u32,
    depth_scale: f32,
) -> Vec<u16> {
    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let units = trace(intrinsics, r, t, &Point2::new(x as f64, y as f64))
                .map(|(z, _, _)| (z / depth_scale as f64).round())
                .filter(|u| *u > 0.0 && *u <= u16::MAX as f64)
                .map_or(0, |u| u as u16);
            out.push(units);
        }
    }
    out
}

/// Test hooks shared with a running [`SyntheticSource`].
#[derive(Debug, Clone, Default)]
pub struct SyntheticControl {
    inner: Arc<ControlState>,
}

#[derive(Debug, Default)]
struct ControlState {
    pending_timeouts: AtomicU32,
    stalled: AtomicBool,
}

impl SyntheticControl {
    /// Make the next `n` waits fail with a timeout.
    pub fn inject_timeouts(&self, n: u32) {
        self.inner.pending_timeouts.fetch_add(n, Ordering::SeqCst);
    }

    /// While stalled, every wait runs to its full timeout.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    fn take_fault(&self) -> bool {
        if self.inner.stalled.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .pending_timeouts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct Rendered {
    color: Option<(Resolution, Bytes)>,
    depth: Option<(Resolution, Bytes)>,
}

/// A [`FrameSource`] producing paced frames of a [`SyntheticScene`].
pub struct SyntheticSource {
    scene: SyntheticScene,
    color_format: PixelFormat,
    color: Option<Resolution>,
    depth: Option<Resolution>,
    rendered: Option<Rendered>,
    streaming: bool,
    sequence: u64,
    next_due: Option<Instant>,
    control: SyntheticControl,
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(SyntheticScene::default())
    }
}

impl SyntheticSource {
    pub fn new(scene: SyntheticScene) -> Self {
        Self {
            scene,
            color_format: PixelFormat::Bgr8,
            color: None,
            depth: None,
            rendered: None,
            streaming: false,
            sequence: 0,
            next_due: None,
            control: SyntheticControl::default(),
        }
    }

    /// Deliver color frames in `format` instead of BGR8.
    pub fn with_color_format(mut self, format: PixelFormat) -> Self {
        self.color_format = format;
        self
    }

    pub fn scene(&self) -> &SyntheticScene {
        &self.scene
    }

    pub fn control(&self) -> SyntheticControl {
        self.control.clone()
    }

    fn period(&self) -> Duration {
        let fps = [self.color, self.depth]
            .iter()
            .flatten()
            .map(|r| r.fps)
            .max()
            .unwrap_or(30)
            .max(1);
        Duration::from_secs_f64(1.0 / fps as f64)
    }

    fn render(&self) -> Result<Rendered, CaptureError> {
        let r = rotation_from_vector(&self.scene.rotation);
        let t = self.scene.translation;
        let color = match self.color {
            Some(res) => {
                let intr = IntrinsicParameters::from_source(&SyntheticScene::intrinsics_for(
                    res.width, res.height,
                ));
                let gray = render_target(&intr, &r, &t, &self.scene.target, res.width, res.height);
                Some((res, encode_color(&gray, self.color_format)?))
            }
            None => None,
        };
        let depth = self.depth.map(|res| {
            let intr =
                IntrinsicParameters::from_source(&SyntheticScene::intrinsics_for(res.width, res.height));
            let units = render_depth(&intr, &r, &t, res.width, res.height, DEPTH_SCALE);
            let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
            (res, Bytes::from(bytes))
        });
        Ok(Rendered { color, depth })
    }
}

fn encode_color(gray: &GrayImage, format: PixelFormat) -> Result<Bytes, CaptureError> {
    let raw = gray.as_raw();
    let bytes = match format {
        PixelFormat::Gray8 => raw.clone(),
        PixelFormat::Rgb8 | PixelFormat::Bgr8 => raw.iter().flat_map(|&g| [g, g, g]).collect(),
        PixelFormat::Yuyv => {
            // Limited-range luma; neutral chroma.
            raw.chunks(2)
                .flat_map(|pair| {
                    let y = |g: u8| (g as f32 * 219.0 / 255.0 + 16.0).round() as u8;
                    let y0 = y(pair[0]);
                    let y1 = pair.get(1).map_or(y0, |&g| y(g));
                    [y0, 128, y1, 128]
                })
                .collect()
        }
        PixelFormat::Mjpeg => {
            let rgb: Vec<u8> = raw.iter().flat_map(|&g| [g, g, g]).collect();
            let mut out = Cursor::new(Vec::new());
            JpegEncoder::new_with_quality(&mut out, 95)
                .encode(&rgb, gray.width(), gray.height(), ExtendedColorType::Rgb8)
                .map_err(|e| CaptureError::Source(format!("jpeg encode failed: {e}")))?;
            out.into_inner()
        }
        PixelFormat::Z16 => {
            return Err(CaptureError::Unsupported("Z16 is not a color format".into()));
        }
    };
    Ok(Bytes::from(bytes))
}

impl FrameSource for SyntheticSource {
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if self.streaming {
            return Err(CaptureError::AlreadyStreaming);
        }
        if self.color_format == PixelFormat::Yuyv && config.color.width % 2 != 0 {
            return Err(CaptureError::Unsupported("YUYV needs an even width".into()));
        }
        let color = config.color.enabled.then(|| config.color.resolution());
        let depth = config.depth.enabled.then(|| config.depth.resolution());
        if color.is_none() && depth.is_none() {
            return Err(CaptureError::Unsupported("no stream enabled".into()));
        }
        if (color, depth) != (self.color, self.depth) {
            self.rendered = None;
        }
        self.color = color;
        self.depth = depth;
        debug!(?color, ?depth, "Synthetic source configured");
        Ok(())
    }

    fn start(&mut self) -> Result<StreamHandle, CaptureError> {
        if self.streaming {
            return Err(CaptureError::AlreadyStreaming);
        }
        if self.color.is_none() && self.depth.is_none() {
            self.configure(&CaptureConfig::default())?;
        }
        if self.rendered.is_none() {
            let started = Instant::now();
            self.rendered = Some(self.render()?);
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Rendered synthetic scene");
        }
        self.streaming = true;
        self.next_due = Some(Instant::now());
        info!(format = ?self.color_format, "Synthetic stream started");
        Ok(StreamHandle {
            color: self
                .color
                .map(|r| SyntheticScene::intrinsics_for(r.width, r.height)),
            depth: self
                .depth
                .map(|r| SyntheticScene::intrinsics_for(r.width, r.height)),
            depth_scale: DEPTH_SCALE,
        })
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }
        self.streaming = false;
        self.next_due = None;
        info!(frames = self.sequence, "Synthetic stream stopped");
        Ok(())
    }

    fn wait_for_frame_pair(&mut self, timeout: Duration) -> Result<FramePair, CaptureError> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }
        if self.control.take_fault() {
            thread::sleep(timeout);
            return Err(CaptureError::FrameTimeout(timeout));
        }

        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        let wait = due.saturating_duration_since(now);
        if wait > timeout {
            thread::sleep(timeout);
            return Err(CaptureError::FrameTimeout(timeout));
        }
        thread::sleep(wait);
        // Never schedule in the past, so a slow consumer does not cause a burst.
        self.next_due = Some(due.max(now) + self.period());

        let Some(rendered) = &self.rendered else {
            return Err(CaptureError::NotStreaming);
        };
        self.sequence += 1;
        let color = rendered
            .color
            .as_ref()
            .map(|(res, data)| {
                Frame::new(
                    StreamKind::Color,
                    self.color_format,
                    res.width,
                    res.height,
                    self.sequence,
                    data.clone(),
                )
            })
            .transpose()?;
        let depth = rendered
            .depth
            .as_ref()
            .map(|(res, data)| {
                Frame::new(
                    StreamKind::Depth,
                    PixelFormat::Z16,
                    res.width,
                    res.height,
                    self.sequence,
                    data.clone(),
                )
            })
            .transpose()?;
        Ok(FramePair { color, depth })
    }
}
