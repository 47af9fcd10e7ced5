use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use image::GrayImage;
use tracing::{debug, info, instrument, warn};

use super::detect::{find_chessboard_corners, DetectorParams};
use super::extrinsics::ExtrinsicParameters;
use super::intrinsics::IntrinsicParameters;
use super::pose::{solve_planar_pnp, PoseEstimate, SolverOptions};
use super::prompt::OperatorPrompt;
use super::storage::CalibrationPaths;
use super::subpix::{refine_corners, Refinement};
use super::target::CalibrationTarget;
use crate::capture::{SourceIntrinsics, StreamKind};
use crate::error::{CalibrationError, CalibrationFailure, CalibrationMode};
use crate::pipeline::FrameBuffer;
use crate::CalibrationConfig;

pub const CONFIRMATION_MESSAGE: &str =
    "Place the checkerboard in front of the camera and press Enter to capture a frame for calibration...";

/// Where extrinsic parameters come from.
#[derive(Clone)]
pub enum ExtrinsicsSource {
    /// Confirm with the operator, then use one color snapshot.
    Live(Arc<dyn OperatorPrompt>),
    /// Previously saved matrices.
    Load {
        translation: PathBuf,
        rotation: PathBuf,
    },
    /// A still image of the target.
    Image(PathBuf),
}

impl ExtrinsicsSource {
    pub fn mode(&self) -> CalibrationMode {
        match self {
            ExtrinsicsSource::Live(_) => CalibrationMode::Live,
            ExtrinsicsSource::Load { .. } => CalibrationMode::Load,
            ExtrinsicsSource::Image(_) => CalibrationMode::Image,
        }
    }
}

impl fmt::Debug for ExtrinsicsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtrinsicsSource::Live(_) => f.write_str("Live(..)"),
            ExtrinsicsSource::Load {
                translation,
                rotation,
            } => f
                .debug_struct("Load")
                .field("translation", translation)
                .field("rotation", rotation)
                .finish(),
            ExtrinsicsSource::Image(path) => f.debug_tuple("Image").field(path).finish(),
        }
    }
}

/// Intrinsic mapping and single-shot extrinsic calibration.
///
/// Holds only configuration; results go to the caller and, for image and
/// live runs, to the persisted matrix files.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    target: CalibrationTarget,
    detector: DetectorParams,
    refinement: Refinement,
    solver: SolverOptions,
    max_rms_px: f64,
    paths: CalibrationPaths,
}

impl CalibrationEngine {
    pub fn new(config: &CalibrationConfig) -> Result<Self, CalibrationError> {
        Ok(Self {
            target: CalibrationTarget::from_config(&config.target)?,
            detector: DetectorParams::default(),
            refinement: Refinement::from(&config.refinement),
            solver: SolverOptions {
                max_iterations: config.solver_max_iterations,
            },
            max_rms_px: config.max_rms_px,
            paths: CalibrationPaths::new(&config.translation_path, &config.rotation_path),
        })
    }

    pub fn target(&self) -> &CalibrationTarget {
        &self.target
    }

    pub fn paths(&self) -> &CalibrationPaths {
        &self.paths
    }

    /// K and D from the driver-reported constants.
    pub fn compute_intrinsics(
        &self,
        reported: Option<&SourceIntrinsics>,
    ) -> Result<IntrinsicParameters, CalibrationError> {
        reported
            .map(IntrinsicParameters::from_source)
            .ok_or(CalibrationError::NotStreaming)
    }

    /// Obtain extrinsics from `source`. Image and live runs persist the
    /// result, replacing any earlier calibration files.
    #[instrument(skip_all, fields(mode = %source.mode()))]
    pub fn compute_extrinsics(
        &self,
        source: &ExtrinsicsSource,
        intrinsics: Option<&IntrinsicParameters>,
        buffer: &FrameBuffer,
    ) -> Result<ExtrinsicParameters, CalibrationFailure> {
        let mode = source.mode();
        let result = match source {
            ExtrinsicsSource::Load {
                translation,
                rotation,
            } => ExtrinsicParameters::load(translation, rotation),
            ExtrinsicsSource::Image(path) => intrinsics
                .ok_or(CalibrationError::NotStreaming)
                .and_then(|intr| {
                    let gray = image::open(path)
                        .map_err(|source| CalibrationError::ImageLoad {
                            path: path.clone(),
                            source,
                        })?
                        .to_luma8();
                    self.calibrate_from_image(&gray, intr)
                }),
            ExtrinsicsSource::Live(prompt) => intrinsics
                .ok_or(CalibrationError::NotStreaming)
                .and_then(|intr| {
                    let gray = self.capture_live(prompt.as_ref(), buffer)?;
                    self.calibrate_from_image(&gray, intr)
                }),
        };

        match result {
            Ok(extrinsics) => {
                info!(
                    t = ?extrinsics.t.as_slice(),
                    rvec = ?extrinsics.rotation_vector().as_slice(),
                    "Extrinsics ready"
                );
                Ok(extrinsics)
            }
            Err(cause) => {
                let failure = CalibrationFailure::new(mode, cause);
                warn!(retryable = failure.is_retryable(), "{failure}");
                Err(failure)
            }
        }
    }

    fn capture_live(
        &self,
        prompt: &dyn OperatorPrompt,
        buffer: &FrameBuffer,
    ) -> Result<GrayImage, CalibrationError> {
        let _confirmation = prompt.await_confirmation(CONFIRMATION_MESSAGE)?;
        let frame = buffer
            .snapshot(StreamKind::Color)
            .ok_or(CalibrationError::NoFrameAvailable(StreamKind::Color))?;
        debug!(sequence = frame.sequence(), "Captured calibration frame");
        frame.to_gray().ok_or_else(|| {
            CalibrationError::UnsupportedFrame(format!(
                "{:?} color frame has no luma view",
                frame.meta.format
            ))
        })
    }

    fn calibrate_from_image(
        &self,
        gray: &GrayImage,
        intrinsics: &IntrinsicParameters,
    ) -> Result<ExtrinsicParameters, CalibrationError> {
        let pose = self.estimate_pose(gray, intrinsics)?;
        let extrinsics = ExtrinsicParameters::from_pose(&pose);
        extrinsics.save(&self.paths)?;
        Ok(extrinsics)
    }

    /// Detect, refine and solve without touching the persisted files. Poses
    /// above the configured RMS limit are rejected.
    pub fn estimate_pose(
        &self,
        gray: &GrayImage,
        intrinsics: &IntrinsicParameters,
    ) -> Result<PoseEstimate, CalibrationError> {
        let started = Instant::now();
        let mut corners = find_chessboard_corners(gray, &self.target, &self.detector).ok_or(
            CalibrationError::TargetNotFound {
                cols: self.target.cols,
                rows: self.target.rows,
            },
        )?;
        refine_corners(gray, &mut corners, &self.refinement);

        let pose = solve_planar_pnp(
            &self.target.object_points(),
            &corners,
            intrinsics,
            &self.solver,
        )?;
        info!(
            corners = corners.len(),
            rms_px = pose.rms_error,
            iterations = pose.iterations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Solved target pose"
        );
        if !(pose.rms_error <= self.max_rms_px) {
            return Err(CalibrationError::PoseRejected {
                rms_px: pose.rms_error,
                limit_px: self.max_rms_px,
            });
        }
        Ok(pose)
    }
}
