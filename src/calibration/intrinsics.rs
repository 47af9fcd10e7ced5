use nalgebra::{Matrix3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

use crate::capture::SourceIntrinsics;

/// Brown-Conrady lens distortion, coefficients in `k1, k2, p1, p2, k3` order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    const UNDISTORT_ITERS: usize = 20;

    pub fn from_coeffs(c: [f64; 5]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
        }
    }

    pub fn coeffs(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.coeffs().iter().all(|c| *c == 0.0)
    }

    /// Apply distortion to an undistorted normalized point.
    pub fn distort(&self, n: &Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xy = x * y;
        Vector2::new(
            x * radial + 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy,
        )
    }

    /// Invert [`distort`](Self::distort) by fixed-point iteration.
    pub fn undistort(&self, d: &Vector2<f64>) -> Vector2<f64> {
        if self.is_zero() {
            return *d;
        }
        let mut n = *d;
        for _ in 0..Self::UNDISTORT_ITERS {
            let err = self.distort(&n) - d;
            n -= err;
        }
        n
    }
}

/// Camera matrix K and distortion D.
///
/// Derived once from the driver-reported constants and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicParameters {
    pub k: Matrix3<f64>,
    pub distortion: Distortion,
    pub width: u32,
    pub height: u32,
}

impl IntrinsicParameters {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, distortion: Distortion) -> Self {
        #[rustfmt::skip]
        let k = Matrix3::new(
            fx, 0.0, cx,
            0.0, fy, cy,
            0.0, 0.0, 1.0,
        );
        Self {
            k,
            distortion,
            width: 0,
            height: 0,
        }
    }

    /// Map the driver's focal lengths, principal point and coefficients
    /// into matrix/vector form.
    pub fn from_source(reported: &SourceIntrinsics) -> Self {
        Self {
            width: reported.width,
            height: reported.height,
            ..Self::new(
                reported.fx,
                reported.fy,
                reported.ppx,
                reported.ppy,
                Distortion::from_coeffs(reported.coeffs),
            )
        }
    }

    pub fn fx(&self) -> f64 {
        self.k[(0, 0)]
    }

    pub fn fy(&self) -> f64 {
        self.k[(1, 1)]
    }

    pub fn cx(&self) -> f64 {
        self.k[(0, 2)]
    }

    pub fn cy(&self) -> f64 {
        self.k[(1, 2)]
    }

    /// The distortion vector D.
    pub fn d(&self) -> [f64; 5] {
        self.distortion.coeffs()
    }

    /// Project a camera-frame point to pixels. `None` behind the camera.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z <= f64::EPSILON {
            return None;
        }
        let n = Vector2::new(p.x / p.z, p.y / p.z);
        let d = self.distortion.distort(&n);
        Some(Point2::new(
            self.fx() * d.x + self.cx(),
            self.fy() * d.y + self.cy(),
        ))
    }

    /// Undistorted normalized image coordinates of a pixel.
    pub fn normalize(&self, pixel: &Point2<f64>) -> Vector2<f64> {
        let d = Vector2::new(
            (pixel.x - self.cx()) / self.fx(),
            (pixel.y - self.cy()) / self.fy(),
        );
        self.distortion.undistort(&d)
    }

    /// Camera-frame point seen at `pixel` at `depth` meters along the optical axis.
    pub fn deproject(&self, pixel: &Point2<f64>, depth: f64) -> Point3<f64> {
        let n = self.normalize(pixel);
        Point3::new(n.x * depth, n.y * depth, depth)
    }
}
