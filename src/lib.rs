pub mod calibration;
pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource, PixelFormat, Resolution, StreamKind};
pub use error::{
    CalibrationError, CalibrationFailure, CaptureError, ConfigError, ExportError, SessionError,
};
pub use pipeline::FrameBuffer;
pub use session::{CameraSession, SessionState};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub acquisition: AcquisitionConfig,
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub color: StreamSettings,
    pub depth: StreamSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamSettings {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamSettings {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Upper bound on a single driver wait
    pub wait_timeout_ms: u64,
    /// Frame pairs discarded after every stream start
    pub warmup_frames: u32,
    /// Consecutive wait failures before the session is marked degraded
    pub max_consecutive_failures: u32,
    /// Extra time granted to the worker on stop, beyond one wait timeout
    pub stop_grace_ms: u64,
}

impl AcquisitionConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn stop_deadline(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms + self.stop_grace_ms)
    }
}

/// How extrinsics are obtained when the binary starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupMode {
    Live,
    Load,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub mode: StartupMode,
    pub target: TargetConfig,
    pub refinement: RefinementConfig,
    pub solver_max_iterations: u32,
    /// Solved poses with a larger RMS reprojection error are rejected
    pub max_rms_px: f64,
    pub translation_path: PathBuf,
    pub rotation_path: PathBuf,
    pub image_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Inner corners per row
    pub cols: usize,
    /// Inner corners per column
    pub rows: usize,
    pub square_size_m: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefinementConfig {
    /// Half side of the sub-pixel search window, in pixels
    pub half_window: usize,
    pub max_iterations: u32,
    pub epsilon: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let stream = StreamSettings {
            enabled: true,
            width: 640,
            height: 480,
            fps: 30,
        };
        Self {
            color: stream,
            depth: stream,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 1000,
            warmup_frames: 10,
            max_consecutive_failures: 5,
            stop_grace_ms: 250,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            mode: StartupMode::Live,
            target: TargetConfig {
                cols: 6,
                rows: 9,
                square_size_m: 0.0253,
            },
            refinement: RefinementConfig {
                half_window: 11,
                max_iterations: 30,
                epsilon: 0.001,
            },
            solver_max_iterations: 50,
            max_rms_px: 1.5,
            translation_path: "calibration/camera_translation_matrix.txt".into(),
            rotation_path: "calibration/camera_rotation_matrix.txt".into(),
            image_path: "calibration/checkerboard.png".into(),
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `DEPTHCAM__*` environment
    /// variables, then validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("DEPTHCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if !capture.color.enabled && !capture.depth.enabled {
            return Err(ConfigError::Invalid("no stream is enabled".into()));
        }
        for (name, stream) in [("color", &capture.color), ("depth", &capture.depth)] {
            if stream.enabled && (stream.width == 0 || stream.height == 0 || stream.fps == 0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} stream needs non-zero width, height and fps"
                )));
            }
        }
        if self.acquisition.wait_timeout_ms == 0 {
            return Err(ConfigError::Invalid("wait_timeout_ms must be positive".into()));
        }
        let target = &self.calibration.target;
        if target.cols < 2 || target.rows < 2 {
            return Err(ConfigError::Invalid(format!(
                "calibration target needs at least 2x2 inner corners, got {}x{}",
                target.cols, target.rows
            )));
        }
        if !(target.square_size_m > 0.0) {
            return Err(ConfigError::Invalid("square_size_m must be positive".into()));
        }
        if !(self.calibration.max_rms_px > 0.0) {
            return Err(ConfigError::Invalid("max_rms_px must be positive".into()));
        }
        Ok(())
    }
}
