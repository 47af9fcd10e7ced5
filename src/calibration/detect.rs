//! Checkerboard inner-corner detection
//!
//! Corners of a checkerboard are saddle points of the intensity surface: the
//! Hessian determinant is strongly negative there and along no other image
//! structure. Candidates are the local maxima of that saddle response, kept
//! only when a ring around them shows the two-dark/two-light X pattern. The
//! surviving points are then grown into a lattice from a seed near their
//! centroid, following the local grid steps so perspective is tolerated.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::TAU;

use image::GrayImage;
use nalgebra::{Point2, Vector2};
use tracing::debug;

use super::plane::Plane;
use super::target::CalibrationTarget;

/// Tuning for corner candidate extraction.
#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    /// Pre-smoothing applied before the Hessian is taken
    pub blur_sigma: f32,
    /// Non-maximum suppression radius, in pixels
    pub nms_radius: usize,
    /// Minimum saddle response as a fraction of the strongest one
    pub response_ratio: f32,
    /// Radius of the ring sampled to confirm the X pattern
    pub probe_radius: f64,
    /// Minimum dark/light difference on that ring, in gray levels
    pub min_contrast: f32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            blur_sigma: 1.5,
            nms_radius: 4,
            response_ratio: 0.05,
            probe_radius: 5.0,
            min_contrast: 30.0,
        }
    }
}

const RING_SAMPLES: usize = 16;

/// Locate the target's inner corners in `gray`.
///
/// On success the corners are ordered row-major with `target.cols` corners
/// per row, right-handed in the image, with the first corner being the one
/// nearest the image's top-left. Returns `None` unless exactly the target's
/// grid is found.
pub fn find_chessboard_corners(
    gray: &GrayImage,
    target: &CalibrationTarget,
    params: &DetectorParams,
) -> Option<Vec<Point2<f64>>> {
    let margin = params.probe_radius.ceil() as usize + 2;
    if (gray.width() as usize) <= 2 * margin || (gray.height() as usize) <= 2 * margin {
        return None;
    }

    let smooth = Plane::from_gray(gray).gaussian_blur(params.blur_sigma);
    let candidates = saddle_candidates(&smooth, params, margin);
    let corners: Vec<Point2<f64>> = candidates
        .into_iter()
        .filter(|p| is_x_junction(&smooth, p, params))
        .collect();
    debug!(candidates = corners.len(), "Checkerboard corner candidates");

    if corners.len() < target.corner_count() {
        return None;
    }
    let lattice = grow_lattice(&corners)?;
    lattice.ordered(&corners, target)
}

fn saddle_candidates(smooth: &Plane, params: &DetectorParams, margin: usize) -> Vec<Point2<f64>> {
    let (w, h) = (smooth.width, smooth.height);
    let mut response = vec![0.0f32; w * h];
    let mut strongest = 0.0f32;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = smooth.at(x, y);
            let fxx = smooth.at(x + 1, y) - 2.0 * c + smooth.at(x - 1, y);
            let fyy = smooth.at(x, y + 1) - 2.0 * c + smooth.at(x, y - 1);
            let fxy = 0.25
                * (smooth.at(x + 1, y + 1) - smooth.at(x + 1, y - 1) - smooth.at(x - 1, y + 1)
                    + smooth.at(x - 1, y - 1));
            let saddle = fxy * fxy - fxx * fyy;
            if saddle > 0.0 {
                response[y * w + x] = saddle;
                strongest = strongest.max(saddle);
            }
        }
    }
    if strongest <= 0.0 {
        return Vec::new();
    }

    let threshold = strongest * params.response_ratio;
    let r = params.nms_radius as isize;
    let mut peaks = Vec::new();
    for y in margin..h - margin {
        for x in margin..w - margin {
            let i = y * w + x;
            let value = response[i];
            if value <= threshold {
                continue;
            }
            let mut is_peak = true;
            'window: for dy in -r..=r {
                for dx in -r..=r {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                    let ny = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                    let j = ny * w + nx;
                    let other = response[j];
                    // Ties go to the earlier pixel so plateaus yield one peak.
                    if other > value || (other == value && j < i) {
                        is_peak = false;
                        break 'window;
                    }
                }
            }
            if is_peak {
                peaks.push(Point2::new(x as f64, y as f64));
            }
        }
    }
    peaks
}

/// A checkerboard corner has exactly four dark/light transitions on a ring
/// around it, and diametrically opposite samples agree.
fn is_x_junction(smooth: &Plane, p: &Point2<f64>, params: &DetectorParams) -> bool {
    let mut ring = [0.0f32; RING_SAMPLES];
    for (k, sample) in ring.iter_mut().enumerate() {
        let angle = TAU * k as f64 / RING_SAMPLES as f64;
        *sample = smooth.sample(
            p.x + params.probe_radius * angle.cos(),
            p.y + params.probe_radius * angle.sin(),
        );
    }
    let lo = ring.iter().cloned().fold(f32::INFINITY, f32::min);
    let hi = ring.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if hi - lo < params.min_contrast {
        return false;
    }
    let mid = 0.5 * (lo + hi);
    let light: Vec<bool> = ring.iter().map(|v| *v > mid).collect();

    let transitions = (0..RING_SAMPLES)
        .filter(|&k| light[k] != light[(k + 1) % RING_SAMPLES])
        .count();
    let half = RING_SAMPLES / 2;
    let symmetric = (0..half).filter(|&k| light[k] == light[k + half]).count();
    transitions == 4 && symmetric + 2 >= half
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    index: usize,
    step_i: Vector2<f64>,
    step_j: Vector2<f64>,
}

struct Lattice {
    cells: HashMap<(i32, i32), Cell>,
}

/// Breadth-first growth of an (i, j) lattice over the corner candidates.
fn grow_lattice(points: &[Point2<f64>]) -> Option<Lattice> {
    let n = points.len() as f64;
    let centroid = points
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / n;
    let seed = (0..points.len()).min_by(|&a, &b| {
        let da = (points[a].coords - centroid).norm_squared();
        let db = (points[b].coords - centroid).norm_squared();
        da.total_cmp(&db)
    })?;

    let mut by_distance: Vec<(f64, usize)> = (0..points.len())
        .filter(|&k| k != seed)
        .map(|k| ((points[k] - points[seed]).norm(), k))
        .collect();
    by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));

    let step_i = points[by_distance.first()?.1] - points[seed];
    let step_j = by_distance
        .iter()
        .take(8)
        .map(|&(_, k)| points[k] - points[seed])
        .find(|d| {
            let cos = d.dot(&step_i) / (d.norm() * step_i.norm());
            cos.abs() < 0.5 && d.norm() < 2.0 * step_i.norm()
        })?;

    let mut used = vec![false; points.len()];
    let mut cells = HashMap::new();
    let mut queue = VecDeque::new();
    used[seed] = true;
    cells.insert(
        (0, 0),
        Cell {
            index: seed,
            step_i,
            step_j,
        },
    );
    queue.push_back((0, 0));

    while let Some((i, j)) = queue.pop_front() {
        let cell = cells[&(i, j)];
        let origin = points[cell.index];
        for (di, dj) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let key = (i + di, j + dj);
            if cells.contains_key(&key) {
                continue;
            }
            let predicted = origin + cell.step_i * di as f64 + cell.step_j * dj as f64;
            let tolerance = 0.3 * cell.step_i.norm().min(cell.step_j.norm());
            let found = (0..points.len())
                .filter(|&k| !used[k])
                .map(|k| ((points[k] - predicted).norm(), k))
                .filter(|(d, _)| *d < tolerance)
                .min_by(|a, b| a.0.total_cmp(&b.0));
            let Some((_, k)) = found else {
                continue;
            };
            let actual = points[k] - origin;
            let (step_i, step_j) = if di != 0 {
                (actual * di as f64, cell.step_j)
            } else {
                (cell.step_i, actual * dj as f64)
            };
            used[k] = true;
            cells.insert(
                key,
                Cell {
                    index: k,
                    step_i,
                    step_j,
                },
            );
            queue.push_back(key);
        }
    }

    Some(Lattice { cells })
}

impl Lattice {
    /// Map the lattice onto the target grid in canonical order.
    fn ordered(&self, points: &[Point2<f64>], target: &CalibrationTarget) -> Option<Vec<Point2<f64>>> {
        if self.cells.len() != target.corner_count() {
            debug!(
                found = self.cells.len(),
                expected = target.corner_count(),
                "Lattice size does not match the target"
            );
            return None;
        }
        let min_i = self.cells.keys().map(|k| k.0).min()?;
        let max_i = self.cells.keys().map(|k| k.0).max()?;
        let min_j = self.cells.keys().map(|k| k.1).min()?;
        let max_j = self.cells.keys().map(|k| k.1).max()?;
        let extent_i = (max_i - min_i + 1) as usize;
        let extent_j = (max_j - min_j + 1) as usize;
        if extent_i * extent_j != target.corner_count() {
            return None;
        }

        let at = |a: usize, b: usize| -> Option<Point2<f64>> {
            self.cells
                .get(&(min_i + a as i32, min_j + b as i32))
                .map(|c| points[c.index])
        };

        let (cols, rows) = (target.cols, target.rows);
        let mut best: Option<(f64, Vec<Point2<f64>>)> = None;
        for transpose in [false, true] {
            let dims = if transpose {
                (extent_j, extent_i)
            } else {
                (extent_i, extent_j)
            };
            if dims != (cols, rows) {
                continue;
            }
            for flip_a in [false, true] {
                for flip_b in [false, true] {
                    let mut ordered = Vec::with_capacity(cols * rows);
                    for y in 0..rows {
                        for x in 0..cols {
                            let (a, b) = if transpose { (y, x) } else { (x, y) };
                            let a = if flip_a { extent_i - 1 - a } else { a };
                            let b = if flip_b { extent_j - 1 - b } else { b };
                            ordered.push(at(a, b)?);
                        }
                    }
                    let u = ordered[1] - ordered[0];
                    let v = ordered[cols] - ordered[0];
                    if u.x * v.y - u.y * v.x <= 0.0 {
                        continue;
                    }
                    let score = ordered[0].x + ordered[0].y;
                    if best.as_ref().map_or(true, |(s, _)| score < *s) {
                        best = Some((score, ordered));
                    }
                }
            }
        }
        best.map(|(_, ordered)| ordered)
    }
}
