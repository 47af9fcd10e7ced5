//! Error types for capture, calibration and session control

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::capture::StreamKind;

/// Failures raised by a [`FrameSource`](crate::capture::FrameSource) or while
/// normalizing the frames it produced.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The driver did not deliver a frame pair within the wait budget.
    #[error("timed out after {0:?} waiting for a frame pair")]
    FrameTimeout(Duration),
    #[error("frame source is not streaming")]
    NotStreaming,
    #[error("frame source is already streaming")]
    AlreadyStreaming,
    #[error("unsupported stream configuration: {0}")]
    Unsupported(String),
    #[error("malformed {stream} frame: {reason}")]
    InvalidFrame { stream: StreamKind, reason: String },
    #[error("frame decode failed: {0}")]
    Decode(#[from] image::ImageError),
    /// Any other driver-level failure.
    #[error("frame source failure: {0}")]
    Source(String),
}

/// Causes of a failed intrinsic or extrinsic calibration.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// No reported intrinsics yet; the session has not been started.
    #[error("camera is not streaming; start the session before calibrating")]
    NotStreaming,
    #[error("no {0} frame has been published yet")]
    NoFrameAvailable(StreamKind),
    #[error(
        "calibration target ({cols}x{rows} inner corners) not found; \
         ensure the board is fully visible and well lit"
    )]
    TargetNotFound { cols: usize, rows: usize },
    #[error("could not load image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("calibration file {path} could not be read: {source}")]
    FileMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("calibration file {path} is invalid: {reason}")]
    FileInvalid { path: PathBuf, reason: String },
    #[error("could not write calibration file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("pose estimation failed: {0}")]
    PoseEstimation(String),
    /// The solver converged but the corners do not fit the pose well enough.
    #[error("solved pose rejected: reprojection RMS {rms_px:.3} px exceeds {limit_px:.3} px")]
    PoseRejected { rms_px: f64, limit_px: f64 },
    #[error("calibration target definition is invalid: {0}")]
    InvalidTarget(String),
    #[error("frame cannot be used for calibration: {0}")]
    UnsupportedFrame(String),
    #[error("operator cancelled the calibration capture")]
    Cancelled,
}

impl CalibrationError {
    /// Whether the caller can reasonably retry with a new capture or image.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CalibrationError::TargetNotFound { .. }
                | CalibrationError::NoFrameAvailable(_)
                | CalibrationError::PoseRejected { .. }
                | CalibrationError::Cancelled
        )
    }
}

/// Which extrinsic calibration path produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMode {
    Live,
    Load,
    Image,
}

impl fmt::Display for CalibrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationMode::Live => write!(f, "live"),
            CalibrationMode::Load => write!(f, "load"),
            CalibrationMode::Image => write!(f, "image"),
        }
    }
}

/// A calibration error tagged with the mode it happened in.
#[derive(Debug, Error)]
#[error("{mode} calibration failed: {cause}")]
pub struct CalibrationFailure {
    pub mode: CalibrationMode,
    #[source]
    pub cause: CalibrationError,
}

impl CalibrationFailure {
    pub fn new(mode: CalibrationMode, cause: CalibrationError) -> Self {
        Self { mode, cause }
    }

    pub fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }
}

/// Session lifecycle failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start frame source: {0}")]
    Start(#[source] CaptureError),
    #[error("frame source was lost when the acquisition thread panicked")]
    SourceLost,
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Failures while writing captured frames to disk.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("{0} frame has no image representation")]
    Unsupported(StreamKind),
    #[error("failed to encode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
