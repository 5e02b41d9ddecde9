//! Rigid transforms for object pose tracking.
//!
//! `SE3` maps points from the object/model frame to the camera frame
//! (`p_cam = T_cm * p_model`). `Pose` wraps an `SE3` together with a
//! validity flag: poses start invalid and become valid only once
//! initialization succeeds.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3};

/// Small angle threshold for the axis-angle log map.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-9;

/// Rigid transform: rotation stored as a unit quaternion plus translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and translation vector.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_matrix(&rotation),
            translation,
        }
    }

    /// Build from translation plus axis-angle rotation (theta-u vector).
    /// This is the representation used by the on-disk pose record.
    pub fn from_tu(translation: Vector3<f64>, theta_u: Vector3<f64>) -> Self {
        let rotation = if theta_u.norm() < SMALL_ANGLE_THRESHOLD {
            UnitQuaternion::identity()
        } else {
            UnitQuaternion::from_scaled_axis(theta_u)
        };
        Self {
            rotation,
            translation,
        }
    }

    /// Axis-angle (theta-u) vector of the rotation.
    pub fn theta_u(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose: `self * other` applies `other` first.
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Rotation angle (radians) and translation distance between two
    /// transforms, used for sanity checks on pose jumps.
    pub fn delta(&self, other: &Self) -> (f64, f64) {
        let rel = self.inverse().compose(other);
        (rel.rotation.angle(), rel.translation.norm())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// Object pose estimate with a validity flag.
///
/// Created invalid; `set` marks it valid. The tracking loop overwrites
/// the transform once per frame while tracking.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    transform: SE3,
    valid: bool,
}

impl Pose {
    pub fn invalid() -> Self {
        Self {
            transform: SE3::identity(),
            valid: false,
        }
    }

    pub fn set(&mut self, transform: SE3) {
        self.transform = transform;
        self.valid = true;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The transform, if the pose has been initialized.
    pub fn transform(&self) -> Option<&SE3> {
        self.valid.then_some(&self.transform)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::invalid()
    }
}
