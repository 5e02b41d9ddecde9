//! Geometry utilities: rigid transforms, camera intrinsics, pose solving.

pub mod camera;
pub mod pnp;
pub mod se3;

pub use camera::CameraModel;
pub use pnp::{solve_pose, PoseSolution};
pub use se3::{Pose, SE3};
