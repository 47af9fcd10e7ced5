//! Contract between the session and the camera driver

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::frame::Frame;
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Factory calibration constants reported by the driver for one stream.
///
/// Distortion coefficients follow the Brown-Conrady order `k1, k2, p1, p2, k3`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceIntrinsics {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub ppx: f64,
    pub ppy: f64,
    pub coeffs: [f64; 5],
}

/// What the driver reports once streaming has started
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamHandle {
    pub color: Option<SourceIntrinsics>,
    pub depth: Option<SourceIntrinsics>,
    /// Meters per depth unit
    pub depth_scale: f32,
}

/// One synchronized delivery from the driver; either side may be missing.
#[derive(Debug, Clone, Default)]
pub struct FramePair {
    pub color: Option<Frame>,
    pub depth: Option<Frame>,
}

/// A blocking stream of synchronized color + depth frames.
///
/// The session owns its source exclusively. While streaming, the acquisition
/// thread holds it and hands it back when it exits.
pub trait FrameSource: Send + 'static {
    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    fn start(&mut self) -> Result<StreamHandle, CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;

    /// Block until a frame pair arrives, or fail with
    /// [`CaptureError::FrameTimeout`] once `timeout` has elapsed.
    fn wait_for_frame_pair(&mut self, timeout: Duration) -> Result<FramePair, CaptureError>;
}
