//! Floating-point image plane used by detection and refinement

use image::GrayImage;

#[derive(Debug, Clone)]
pub(crate) struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width() as usize,
            height: img.height() as usize,
            data: img.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Pixel value with coordinates clamped to the border.
    #[inline]
    pub fn clamped(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.at(x, y)
    }

    /// Bilinear sample; pixel centers sit on integer coordinates.
    pub fn sample(&self, x: f64, y: f64) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;
        let (xi, yi) = (x0 as isize, y0 as isize);
        let top = self.clamped(xi, yi) * (1.0 - fx) + self.clamped(xi + 1, yi) * fx;
        let bottom = self.clamped(xi, yi + 1) * (1.0 - fx) + self.clamped(xi + 1, yi + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Separable Gaussian blur with clamped borders.
    pub fn gaussian_blur(&self, sigma: f32) -> Plane {
        if sigma <= 0.0 {
            return self.clone();
        }
        let radius = (3.0 * sigma).ceil() as isize;
        let mut kernel: Vec<f32> = (-radius..=radius)
            .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
            .collect();
        let sum: f32 = kernel.iter().sum();
        kernel.iter_mut().for_each(|k| *k /= sum);

        let mut horizontal = Plane::zeros(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    acc += weight * self.clamped(x as isize + k as isize - radius, y as isize);
                }
                horizontal.data[y * self.width + x] = acc;
            }
        }

        let mut out = Plane::zeros(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0;
                for (k, weight) in kernel.iter().enumerate() {
                    acc += weight * horizontal.clamped(x as isize, y as isize + k as isize - radius);
                }
                out.data[y * self.width + x] = acc;
            }
        }
        out
    }

    /// Central-difference gradients `(d/dx, d/dy)`.
    pub fn gradients(&self) -> (Plane, Plane) {
        let mut gx = Plane::zeros(self.width, self.height);
        let mut gy = Plane::zeros(self.width, self.height);
        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                let i = y as usize * self.width + x as usize;
                gx.data[i] = 0.5 * (self.clamped(x + 1, y) - self.clamped(x - 1, y));
                gy.data[i] = 0.5 * (self.clamped(x, y + 1) - self.clamped(x, y - 1));
            }
        }
        (gx, gy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_sample_interpolates_between_centers() {
        let img = GrayImage::from_raw(2, 1, vec![0, 100]).unwrap();
        let plane = Plane::from_gray(&img);
        assert_eq!(plane.sample(0.0, 0.0), 0.0);
        assert_eq!(plane.sample(0.25, 0.0), 25.0);
        assert_eq!(plane.sample(1.0, 0.0), 100.0);
        assert_eq!(plane.sample(3.0, 0.0), 100.0);
    }

    #[test]
    fn blur_preserves_constant_image() {
        let img = GrayImage::from_pixel(8, 8, image::Luma([90]));
        let blurred = Plane::from_gray(&img).gaussian_blur(1.5);
        assert!(blurred.data.iter().all(|v| (v - 90.0).abs() < 1e-3));
    }
}
