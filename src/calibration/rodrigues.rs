//! Rotation vector <-> rotation matrix conversion (exponential map)

use nalgebra::{Matrix3, Vector3};

const SMALL_ANGLE: f64 = 1e-12;

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    #[rustfmt::skip]
    let m = Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    );
    m
}

/// `R = I + sin(θ)K + (1 − cos(θ))K²`, with θ = |ω| and K the skew matrix of ω/θ.
pub fn rotation_from_vector(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + skew(omega);
    }
    let k = skew(&(omega / theta));
    Matrix3::identity() + k * theta.sin() + (k * k) * (1.0 - theta.cos())
}

/// Inverse of [`rotation_from_vector`], returning θ in `[0, π]`.
pub fn vector_from_rotation(r: &Matrix3<f64>) -> Vector3<f64> {
    // vee(R - Rᵀ) = 2 sin(θ) n
    let vee = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    );
    let cos_theta = ((r.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = (0.5 * vee.norm()).atan2(cos_theta);

    if theta < SMALL_ANGLE {
        return vee * 0.5;
    }

    if cos_theta > 0.0 {
        return vee * (theta / vee.norm());
    }

    // Near π the antisymmetric part vanishes; recover the axis from the
    // symmetric part: (R + Rᵀ)/2 = cos(θ) I + (1 − cos(θ)) n nᵀ.
    let sym = (r + r.transpose()) * 0.5;
    let nnt = (sym - Matrix3::identity() * cos_theta) / (1.0 - cos_theta);
    let diag = nnt.diagonal();
    let i = diag.imax();
    let mut axis: Vector3<f64> = nnt.column(i).into_owned() / diag[i].max(0.0).sqrt();
    axis.normalize_mut();
    if axis.dot(&vee) < 0.0 {
        axis = -axis;
    }
    axis * theta
}
