//! Sub-pixel corner refinement
//!
//! Around a true corner q every image gradient g at a pixel p is orthogonal
//! to (q - p): either p sits in a flat region (g = 0) or on an edge running
//! through q. Minimizing Σ w (gᵀ(q - p))² over the search window gives the
//! linear system (Σ w g gᵀ) q = Σ w g gᵀ p, re-solved until q stops moving.

use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};

use super::plane::Plane;
use crate::RefinementConfig;

/// When to stop the iterative window search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TermCriteria {
    pub max_iterations: u32,
    /// Stop once a step moves the corner less than this many pixels
    pub epsilon: f64,
}

impl Default for TermCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            epsilon: 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refinement {
    /// Half side of the square search window; the window is `2 * half + 1` px wide
    pub half_window: usize,
    pub criteria: TermCriteria,
}

impl From<&RefinementConfig> for Refinement {
    fn from(config: &RefinementConfig) -> Self {
        Self {
            half_window: config.half_window,
            criteria: TermCriteria {
                max_iterations: config.max_iterations,
                epsilon: config.epsilon,
            },
        }
    }
}

/// Refine `corners` in place. Corners whose estimate wanders outside their
/// search window are left at their initial position.
///
/// Each corner's window is shrunk to stay clear of its nearest detected
/// neighbour, so small squares never pull in the gradients of the next corner.
pub fn refine_corners(gray: &GrayImage, corners: &mut [Point2<f64>], refinement: &Refinement) {
    let (gx, gy) = Plane::from_gray(gray).gradients();
    let eps_sq = refinement.criteria.epsilon.max(0.0).powi(2);
    let spacing = neighbour_spacing(corners);

    for (corner, spacing) in corners.iter_mut().zip(spacing) {
        let half = window_for(refinement.half_window, spacing) as isize;
        let weights = window_weights(half);
        let start = *corner;
        let mut current = start;
        for _ in 0..refinement.criteria.max_iterations {
            let mut a = Matrix2::<f64>::zeros();
            let mut b = Vector2::<f64>::zeros();
            let mut w = weights.iter();
            for dy in -half..=half {
                for dx in -half..=half {
                    let weight = w.next().copied().unwrap_or(0.0);
                    let px = current.x + dx as f64;
                    let py = current.y + dy as f64;
                    let gxv = gx.sample(px, py) as f64;
                    let gyv = gy.sample(px, py) as f64;
                    let gxx = gxv * gxv * weight;
                    let gxy = gxv * gyv * weight;
                    let gyy = gyv * gyv * weight;
                    a[(0, 0)] += gxx;
                    a[(0, 1)] += gxy;
                    a[(1, 0)] += gxy;
                    a[(1, 1)] += gyy;
                    b.x += gxx * px + gxy * py;
                    b.y += gxy * px + gyy * py;
                }
            }
            let Some(inverse) = a.try_inverse() else {
                break;
            };
            let next = Point2::from(inverse * b);
            let moved = (next - current).norm_squared();
            current = next;
            if moved <= eps_sq {
                break;
            }
        }
        let drift = current - start;
        if drift.x.abs() > half as f64 || drift.y.abs() > half as f64 || !drift.x.is_finite() {
            continue;
        }
        *corner = current;
    }
}

const MIN_HALF_WINDOW: usize = 2;

/// Distance from each corner to its nearest other corner.
fn neighbour_spacing(corners: &[Point2<f64>]) -> Vec<f64> {
    corners
        .iter()
        .enumerate()
        .map(|(i, p)| {
            corners
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, q)| (q - p).norm())
                .fold(f64::INFINITY, f64::min)
        })
        .collect()
}

/// Configured half window, capped at half the neighbour distance minus a pixel.
fn window_for(configured: usize, spacing: f64) -> usize {
    let cap = (spacing / 2.0 - 1.0).floor();
    if cap.is_finite() && cap < configured as f64 {
        (cap.max(0.0) as usize).max(MIN_HALF_WINDOW)
    } else {
        configured
    }
}

/// Gaussian-like weights over a `2 * half + 1` square, row-major.
fn window_weights(half: isize) -> Vec<f64> {
    let inv_half_sq = 1.0 / (half.max(1) as f64).powi(2);
    let mut weights = Vec::with_capacity(((2 * half + 1) * (2 * half + 1)) as usize);
    for dy in -half..=half {
        for dx in -half..=half {
            weights.push((-((dx * dx + dy * dy) as f64) * inv_half_sq).exp());
        }
    }
    weights
}
