use std::path::Path;

use nalgebra::{Matrix3, Point3, Vector3};
use tracing::info;

use super::pose::PoseEstimate;
use super::rodrigues::{rotation_from_vector, vector_from_rotation};
use super::storage::{format_rows, read_rows, write_all_atomic, CalibrationPaths};
use crate::error::CalibrationError;

const ORTHONORMAL_TOLERANCE: f64 = 1e-3;

/// World-to-camera rigid transform: `p_cam = R p_world + T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrinsicParameters {
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
}

impl ExtrinsicParameters {
    pub fn new(r: Matrix3<f64>, t: Vector3<f64>) -> Self {
        Self { r, t }
    }

    pub fn from_pose(pose: &PoseEstimate) -> Self {
        Self {
            r: rotation_from_vector(&pose.rotation),
            t: pose.translation,
        }
    }

    pub fn rotation_vector(&self) -> Vector3<f64> {
        vector_from_rotation(&self.r)
    }

    pub fn world_to_camera(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.r * p.coords + self.t)
    }

    /// Express a camera-frame point in the target's world frame, `Rᵀ (p - T)`.
    pub fn camera_to_world(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.r.transpose() * (p.coords - self.t))
    }

    /// Persist T (3 lines) and R (3 rows of 3) to their files.
    pub fn save(&self, paths: &CalibrationPaths) -> Result<(), CalibrationError> {
        let t = format_rows(&[[self.t.x], [self.t.y], [self.t.z]]);
        let rows: Vec<[f64; 3]> = (0..3)
            .map(|i| [self.r[(i, 0)], self.r[(i, 1)], self.r[(i, 2)]])
            .collect();
        let r = format_rows(&rows);
        write_all_atomic(&[
            (paths.translation.as_path(), t.as_str()),
            (paths.rotation.as_path(), r.as_str()),
        ])?;
        info!(
            translation = %paths.translation.display(),
            rotation = %paths.rotation.display(),
            "Saved extrinsics"
        );
        Ok(())
    }

    /// Read previously saved extrinsics; R must be a proper rotation.
    pub fn load(translation: &Path, rotation: &Path) -> Result<Self, CalibrationError> {
        let t_values: Vec<f64> = read_rows(translation)?.into_iter().flatten().collect();
        if t_values.len() != 3 {
            return Err(CalibrationError::FileInvalid {
                path: translation.to_path_buf(),
                reason: format!("expected 3 values, found {}", t_values.len()),
            });
        }

        let r_values: Vec<f64> = read_rows(rotation)?.into_iter().flatten().collect();
        if r_values.len() != 9 {
            return Err(CalibrationError::FileInvalid {
                path: rotation.to_path_buf(),
                reason: format!("expected 9 values, found {}", r_values.len()),
            });
        }
        let r = Matrix3::from_row_slice(&r_values);

        let ortho_error = (r.transpose() * r - Matrix3::identity()).abs().max();
        if ortho_error > ORTHONORMAL_TOLERANCE || r.determinant() <= 0.0 {
            return Err(CalibrationError::FileInvalid {
                path: rotation.to_path_buf(),
                reason: format!(
                    "not a rotation matrix (|RᵀR - I| = {ortho_error:.2e}, det = {:.4})",
                    r.determinant()
                ),
            });
        }

        Ok(Self {
            r,
            t: Vector3::from_column_slice(&t_values),
        })
    }
}
