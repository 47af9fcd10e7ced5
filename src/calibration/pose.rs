//! Planar perspective-n-point pose estimation
//!
//! The pose is initialized from the plane-to-image homography on undistorted
//! normalized coordinates, then refined with Levenberg-Marquardt on the pixel
//! reprojection error over (rotation vector, translation).

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, Point2, Point3, Vector2, Vector3, Vector6};
use tracing::debug;

use super::intrinsics::IntrinsicParameters;
use super::rodrigues::{rotation_from_vector, vector_from_rotation};
use crate::error::CalibrationError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub max_iterations: u32,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self { max_iterations: 50 }
    }
}

/// Solved world-to-camera pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseEstimate {
    /// Axis-angle rotation vector
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
    /// Root-mean-square reprojection error in pixels
    pub rms_error: f64,
    pub iterations: u32,
}

impl PoseEstimate {
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        rotation_from_vector(&self.rotation)
    }
}

/// Root-mean-square pixel distance between `image` and the projections of
/// `object` through (R, T, K, D).
pub fn reprojection_rms(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &IntrinsicParameters,
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
) -> f64 {
    let mut sum = 0.0;
    for (pw, pi) in object.iter().zip(image) {
        let pc = Point3::from(r * pw.coords + t);
        match intrinsics.project(&pc) {
            Some(px) => sum += (px - pi).norm_squared(),
            None => return f64::INFINITY,
        }
    }
    (sum / object.len().max(1) as f64).sqrt()
}

/// Recover the pose of a planar (z = 0) target from its image projections.
pub fn solve_planar_pnp(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &IntrinsicParameters,
    options: &SolverOptions,
) -> Result<PoseEstimate, CalibrationError> {
    let n = object.len();
    if n < 4 || image.len() != n {
        return Err(CalibrationError::PoseEstimation(format!(
            "need at least 4 matching correspondences, got {n} object / {} image points",
            image.len()
        )));
    }
    if object.iter().any(|p| p.z.abs() > 1e-12) {
        return Err(CalibrationError::PoseEstimation(
            "object points must lie on the z = 0 plane".into(),
        ));
    }

    let plane: Vec<Vector2<f64>> = object.iter().map(|p| Vector2::new(p.x, p.y)).collect();
    let normalized: Vec<Vector2<f64>> = image.iter().map(|p| intrinsics.normalize(p)).collect();
    let h = homography(&plane, &normalized).ok_or_else(|| {
        CalibrationError::PoseEstimation("degenerate point configuration".into())
    })?;
    let (r0, t0) = pose_from_homography(&h).ok_or_else(|| {
        CalibrationError::PoseEstimation("homography does not describe a plane in front of the camera".into())
    })?;

    let mut params = Vector6::new(0.0, 0.0, 0.0, t0.x, t0.y, t0.z);
    params
        .fixed_rows_mut::<3>(0)
        .copy_from(&vector_from_rotation(&r0));

    let (params, iterations) = levenberg_marquardt(object, image, intrinsics, params, options);
    let rotation: Vector3<f64> = params.fixed_rows::<3>(0).into_owned();
    let translation: Vector3<f64> = params.fixed_rows::<3>(3).into_owned();
    let rms_error = reprojection_rms(
        object,
        image,
        intrinsics,
        &rotation_from_vector(&rotation),
        &translation,
    );
    if !rms_error.is_finite() {
        return Err(CalibrationError::PoseEstimation(
            "solution places target points behind the camera".into(),
        ));
    }
    debug!(rms_error, iterations, "Pose refined");

    Ok(PoseEstimate {
        rotation,
        translation,
        rms_error,
        iterations,
    })
}

/// Similarity transform moving points to zero mean and √2 mean distance.
fn conditioning(points: &[Vector2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    let s = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    #[rustfmt::skip]
    let t = Matrix3::new(
        s, 0.0, -s * centroid.x,
        0.0, s, -s * centroid.y,
        0.0, 0.0, 1.0,
    );
    t
}

/// Normalized DLT estimate of H with `dst ~ H src`.
fn homography(src: &[Vector2<f64>], dst: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let ts = conditioning(src);
    let td = conditioning(dst);
    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (ps, pd)) in src.iter().zip(dst).enumerate() {
        let s = ts * ps.push(1.0);
        let d = td * pd.push(1.0);
        let (x, y) = (s.x, s.y);
        let (u, v) = (d.x, d.y);
        let (r0, r1) = (2 * i, 2 * i + 1);
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;
        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Null vector of A from the smallest eigenpair of AᵀA.
    let eig = (a.transpose() * &a).symmetric_eigen();
    let min_idx = eig.eigenvalues.imin();
    let h = eig.eigenvectors.column(min_idx);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let h = td.try_inverse()? * hn * ts;
    if h.iter().all(|v| v.is_finite()) && h.norm() > f64::EPSILON {
        Some(h)
    } else {
        None
    }
}

/// Split `H ~ [r1 r2 t]` into a proper rotation and a translation with z > 0.
fn pose_from_homography(h: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let h1 = h.column(0);
    let h2 = h.column(1);
    let h3 = h.column(2);
    let norm = 0.5 * (h1.norm() + h2.norm());
    if norm <= f64::EPSILON {
        return None;
    }
    let mut scale = 1.0 / norm;
    if h3[2] * scale < 0.0 {
        scale = -scale;
    }
    let r1: Vector3<f64> = h1 * scale;
    let r2: Vector3<f64> = h2 * scale;
    let t: Vector3<f64> = h3 * scale;
    let r3 = r1.cross(&r2);
    let approx = Matrix3::from_columns(&[r1, r2, r3]);

    // Nearest rotation in the Frobenius sense.
    let svd = approx.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    Some((r, t))
}

fn residuals(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &IntrinsicParameters,
    params: &Vector6<f64>,
) -> Option<DVector<f64>> {
    let r = rotation_from_vector(&params.fixed_rows::<3>(0).into_owned());
    let t: Vector3<f64> = params.fixed_rows::<3>(3).into_owned();
    let mut out = DVector::zeros(2 * object.len());
    for (i, (pw, pi)) in object.iter().zip(image).enumerate() {
        let projected = intrinsics.project(&Point3::from(r * pw.coords + t))?;
        out[2 * i] = projected.x - pi.x;
        out[2 * i + 1] = projected.y - pi.y;
    }
    Some(out)
}

fn levenberg_marquardt(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    intrinsics: &IntrinsicParameters,
    initial: Vector6<f64>,
    options: &SolverOptions,
) -> (Vector6<f64>, u32) {
    const STEP: f64 = 1e-6;
    let mut params = initial;
    let Some(mut residual) = residuals(object, image, intrinsics, &params) else {
        return (params, 0);
    };
    let mut cost = residual.norm_squared();
    let mut lambda = 1e-3;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        iterations += 1;

        // Central-difference Jacobian of the residual vector.
        let mut jacobian = DMatrix::<f64>::zeros(residual.len(), 6);
        for j in 0..6 {
            let mut plus = params;
            let mut minus = params;
            plus[j] += STEP;
            minus[j] -= STEP;
            let (Some(rp), Some(rm)) = (
                residuals(object, image, intrinsics, &plus),
                residuals(object, image, intrinsics, &minus),
            ) else {
                return (params, iterations);
            };
            jacobian.set_column(j, &((rp - rm) / (2.0 * STEP)));
        }
        let jt = jacobian.transpose();
        let jtj: Matrix6<f64> = (&jt * &jacobian).fixed_view::<6, 6>(0, 0).into_owned();
        let gradient: Vector6<f64> = (&jt * &residual).fixed_rows::<6>(0).into_owned();

        let mut improved = false;
        while lambda < 1e12 {
            let mut damped = jtj;
            for d in 0..6 {
                damped[(d, d)] += lambda * jtj[(d, d)].max(1e-12);
            }
            let Some(step) = damped.cholesky().map(|c| c.solve(&-gradient)) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = params + step;
            match residuals(object, image, intrinsics, &candidate) {
                Some(r) if r.norm_squared() < cost => {
                    let new_cost = r.norm_squared();
                    let decrease = cost - new_cost;
                    params = candidate;
                    residual = r;
                    cost = new_cost;
                    lambda = (lambda * 0.1).max(1e-12);
                    improved = true;
                    if step.norm() < 1e-12 * (params.norm() + 1e-12) || decrease < 1e-14 * (cost + 1e-30)
                    {
                        return (params, iterations);
                    }
                    break;
                }
                _ => lambda *= 10.0,
            }
        }
        if !improved {
            break;
        }
    }
    (params, iterations)
}
