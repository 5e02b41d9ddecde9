//! Pinhole camera intrinsics with radial distortion.

use nalgebra::{Matrix3, Vector2, Vector3};

/// Intrinsic calibration received from the camera-info stream.
///
/// Immutable once received for a given stream; a recalibration upstream
/// replaces the model carried by subsequent frames without touching the
/// current pose estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Radial distortion coefficients (k1, k2). Zero for rectified streams.
    pub k1: f64,
    pub k2: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
        }
    }

    pub fn with_distortion(mut self, k1: f64, k2: f64) -> Self {
        self.k1 = k1;
        self.k2 = k2;
        self
    }

    pub fn from_k(k: &Matrix3<f64>) -> Self {
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)])
    }

    /// Project a camera-frame point to pixel coordinates, applying
    /// radial distortion. Returns None for points at or behind the
    /// optical center plane.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let xn = p_cam.x / p_cam.z;
        let yn = p_cam.y / p_cam.z;
        let r2 = xn * xn + yn * yn;
        let d = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        Some(Vector2::new(
            self.fx * xn * d + self.cx,
            self.fy * yn * d + self.cy,
        ))
    }

    /// Pixel coordinates to normalized image coordinates (undistorted
    /// iteratively when distortion is present).
    pub fn unproject(&self, px: &Vector2<f64>) -> Vector2<f64> {
        let xd = (px.x - self.cx) / self.fx;
        let yd = (px.y - self.cy) / self.fy;
        if self.k1 == 0.0 && self.k2 == 0.0 {
            return Vector2::new(xd, yd);
        }
        // Fixed-point undistortion; converges in a handful of iterations
        // for moderate radial distortion.
        let mut x = xd;
        let mut y = yd;
        for _ in 0..8 {
            let r2 = x * x + y * y;
            let d = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
            x = xd / d;
            y = yd / d;
        }
        Vector2::new(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(600.0, 600.0, 320.0, 240.0)
    }

    #[test]
    fn test_project_center() {
        let px = camera().project(&Vector3::new(0.0, 0.0, 1.0)).unwrap();
        assert_relative_eq!(px, Vector2::new(320.0, 240.0), epsilon = 1e-12);
    }

    #[test]
    fn test_behind_camera_rejected() {
        assert!(camera().project(&Vector3::new(0.1, 0.1, -1.0)).is_none());
        assert!(camera().project(&Vector3::new(0.1, 0.1, 0.0)).is_none());
    }

    #[test]
    fn test_unproject_round_trip_with_distortion() {
        let cam = camera().with_distortion(-0.18, 0.03);
        let p = Vector3::new(0.12, -0.05, 0.9);
        let px = cam.project(&p).unwrap();
        let n = cam.unproject(&px);
        assert_relative_eq!(n.x, p.x / p.z, epsilon = 1e-6);
        assert_relative_eq!(n.y, p.y / p.z, epsilon = 1e-6);
    }
}
