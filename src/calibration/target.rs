use nalgebra::Point3;

use crate::error::CalibrationError;
use crate::TargetConfig;

/// Planar checkerboard with a known inner-corner grid and square size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationTarget {
    /// Inner corners per row
    pub cols: usize,
    /// Inner corners per column
    pub rows: usize,
    /// Square side in meters
    pub square_size: f64,
}

impl CalibrationTarget {
    pub fn new(cols: usize, rows: usize, square_size: f64) -> Result<Self, CalibrationError> {
        if cols < 2 || rows < 2 {
            return Err(CalibrationError::InvalidTarget(format!(
                "need at least 2x2 inner corners, got {cols}x{rows}"
            )));
        }
        if !(square_size > 0.0) || !square_size.is_finite() {
            return Err(CalibrationError::InvalidTarget(format!(
                "square size must be positive, got {square_size}"
            )));
        }
        Ok(Self {
            cols,
            rows,
            square_size,
        })
    }

    pub fn from_config(config: &TargetConfig) -> Result<Self, CalibrationError> {
        Self::new(config.cols, config.rows, config.square_size_m)
    }

    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Known 3-D corner positions on the z = 0 plane, row-major with `cols`
    /// corners per row; corner k sits at `(k mod cols, k div cols) * square`.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        (0..self.rows)
            .flat_map(|y| (0..self.cols).map(move |x| (x, y)))
            .map(|(x, y)| {
                Point3::new(
                    x as f64 * self.square_size,
                    y as f64 * self.square_size,
                    0.0,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_points_are_row_major_and_planar() {
        let target = CalibrationTarget::new(6, 9, 0.0253).unwrap();
        let pts = target.object_points();
        assert_eq!(pts.len(), 54);
        assert_eq!(pts[0], Point3::new(0.0, 0.0, 0.0));
        assert!((pts[1].x - 0.0253).abs() < 1e-15);
        assert_eq!(pts[6].x, 0.0);
        assert!((pts[6].y - 0.0253).abs() < 1e-15);
        assert!((pts[53].x - 5.0 * 0.0253).abs() < 1e-12);
        assert!((pts[53].y - 8.0 * 0.0253).abs() < 1e-12);
        assert!(pts.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn rejects_degenerate_targets() {
        assert!(CalibrationTarget::new(1, 9, 0.02).is_err());
        assert!(CalibrationTarget::new(6, 9, 0.0).is_err());
        assert!(CalibrationTarget::new(6, 9, f64::NAN).is_err());
    }
}
