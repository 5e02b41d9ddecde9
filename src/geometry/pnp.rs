//! Pose-from-points solve for initialization.
//!
//! Given n 3D model points and their observed pixel locations, estimates
//! the model-to-camera transform. Coplanar sets (fiducial corners, flat
//! init-point files) go through a homography decomposition and need only
//! 4 points; general sets use a normalized DLT and need 6. Both linear
//! estimates are polished with a Gauss-Newton pass on the reprojection
//! residuals.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, Vector2, Vector3, Vector6};

use crate::error::SolveError;
use crate::geometry::camera::CameraModel;
use crate::geometry::se3::SE3;

/// Minimum correspondences for the planar solve.
pub const MIN_POINTS_PLANAR: usize = 4;
/// Minimum correspondences for the general DLT solve.
pub const MIN_POINTS_GENERAL: usize = 6;

/// Relative thickness below which a point set is treated as coplanar.
const COPLANARITY_RATIO: f64 = 1e-3;
const GAUSS_NEWTON_ITERS: usize = 15;
const GAUSS_NEWTON_TOL: f64 = 1e-10;

/// Pose estimate with per-correspondence reprojection errors (pixels).
#[derive(Debug, Clone)]
pub struct PoseSolution {
    pub pose: SE3,
    pub reproj_errors: Vec<f64>,
    pub mean_error_px: f64,
}

/// Solve for the model-to-camera transform from 3D-2D correspondences.
///
/// Picks the planar or general linear path from the point geometry, then
/// refines. `points2d` are raw pixel observations; distortion is removed
/// through the camera model before the linear solve.
pub fn solve_pose(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
) -> Result<PoseSolution, SolveError> {
    let n = points3d.len();
    if n != points2d.len() || n < MIN_POINTS_PLANAR {
        return Err(SolveError::TooFewPoints {
            needed: MIN_POINTS_PLANAR,
            got: n.min(points2d.len()),
        });
    }

    // Normalized (undistorted) image coordinates.
    let normalized: Vec<Vector2<f64>> = points2d.iter().map(|p| camera.unproject(p)).collect();

    let initial = match plane_basis(points3d) {
        Some(plane) => solve_planar(points3d, &normalized, &plane)?,
        None => {
            if n < MIN_POINTS_GENERAL {
                return Err(SolveError::TooFewPoints {
                    needed: MIN_POINTS_GENERAL,
                    got: n,
                });
            }
            solve_dlt(points3d, &normalized)?
        }
    };

    let pose = refine(points3d, &normalized, initial);
    let reproj_errors = reprojection_errors(points3d, points2d, camera, &pose);
    let mean_error_px = reproj_errors.iter().sum::<f64>() / reproj_errors.len() as f64;
    Ok(PoseSolution {
        pose,
        reproj_errors,
        mean_error_px,
    })
}

/// Per-point pixel reprojection errors for a candidate pose. Points that
/// project behind the camera get an infinite error.
pub fn reprojection_errors(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    pose: &SE3,
) -> Vec<f64> {
    points3d
        .iter()
        .zip(points2d.iter())
        .map(|(p3, p2)| {
            let p_cam = pose.transform_point(p3);
            match camera.project(&p_cam) {
                Some(px) => (px - p2).norm(),
                None => f64::INFINITY,
            }
        })
        .collect()
}

/// Orthonormal frame of the best-fit plane through the point set.
struct PlaneBasis {
    centroid: Vector3<f64>,
    e1: Vector3<f64>,
    e2: Vector3<f64>,
    e3: Vector3<f64>,
}

/// Fit a plane through the points; `None` if the set is not coplanar
/// (or is degenerate along a line).
fn plane_basis(points: &[Vector3<f64>]) -> Option<PlaneBasis> {
    let n = points.len() as f64;
    let centroid = points.iter().sum::<Vector3<f64>>() / n;

    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    let eig = cov.symmetric_eigen();

    // The smallest eigenvalue measures thickness along the plane normal.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    let (i_min, i_mid, i_max) = (order[0], order[1], order[2]);
    if eig.eigenvalues[i_mid] <= f64::EPSILON * eig.eigenvalues[i_max].max(1.0) {
        // Collinear or coincident points.
        return None;
    }
    if eig.eigenvalues[i_min] / eig.eigenvalues[i_max] > COPLANARITY_RATIO {
        return None;
    }

    let e1: Vector3<f64> = eig.eigenvectors.column(i_max).into_owned();
    let normal: Vector3<f64> = eig.eigenvectors.column(i_min).into_owned();
    let mut e2 = normal.cross(&e1);
    if e2.norm() < f64::EPSILON {
        return None;
    }
    e2.normalize_mut();
    let e3 = e1.cross(&e2);
    Some(PlaneBasis {
        centroid,
        e1,
        e2,
        e3,
    })
}

/// Planar pose: homography from in-plane coordinates to normalized image
/// coordinates, decomposed into rotation columns and translation.
fn solve_planar(
    points3d: &[Vector3<f64>],
    normalized: &[Vector2<f64>],
    plane: &PlaneBasis,
) -> Result<SE3, SolveError> {
    let n = points3d.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (p3, m)) in points3d.iter().zip(normalized.iter()).enumerate() {
        let d = p3 - plane.centroid;
        let u = d.dot(&plane.e1);
        let v = d.dot(&plane.e2);
        let (x, y) = (m.x, m.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        a[(r0, 0)] = u;
        a[(r0, 1)] = v;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -x * u;
        a[(r0, 7)] = -x * v;
        a[(r0, 8)] = -x;
        a[(r1, 3)] = u;
        a[(r1, 4)] = v;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -y * u;
        a[(r1, 7)] = -y * v;
        a[(r1, 8)] = -y;
    }

    let h = null_vector(a)?;
    let h1 = Vector3::new(h[0], h[3], h[6]);
    let h2 = Vector3::new(h[1], h[4], h[7]);
    let h3 = Vector3::new(h[2], h[5], h[8]);

    let scale = 2.0 / (h1.norm() + h2.norm());
    if !scale.is_finite() || scale <= 0.0 {
        return Err(SolveError::Degenerate);
    }
    let mut r1 = h1 * scale;
    let mut r2 = h2 * scale;
    let mut t = h3 * scale;
    // The null vector is defined up to sign; the plane origin must sit
    // in front of the camera.
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    let r_approx = Matrix3::from_columns(&[r1, r2, r3]);
    let r_plane = project_so3(&r_approx)?;

    // T_cam_model = T_cam_plane * T_plane_model.
    let t_cam_plane = SE3::from_rt(r_plane, t);
    let r_plane_model = Matrix3::from_rows(&[
        plane.e1.transpose(),
        plane.e2.transpose(),
        plane.e3.transpose(),
    ]);
    let t_plane_model = SE3::from_rt(r_plane_model, -(r_plane_model * plane.centroid));
    Ok(t_cam_plane.compose(&t_plane_model))
}

/// Normalized DLT on the full 3D point set (non-coplanar, n >= 6).
fn solve_dlt(points3d: &[Vector3<f64>], normalized: &[Vector2<f64>]) -> Result<SE3, SolveError> {
    let n = points3d.len();
    let centroid = points3d.iter().sum::<Vector3<f64>>() / n as f64;
    let mean_dist = points3d.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n as f64;
    if mean_dist <= f64::EPSILON {
        return Err(SolveError::Degenerate);
    }
    let scale = 3f64.sqrt() / mean_dist;

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (p3, m)) in points3d.iter().zip(normalized.iter()).enumerate() {
        let q = (p3 - centroid) * scale;
        let (u, v) = (m.x, m.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = q.x;
        a[(r0, 1)] = q.y;
        a[(r0, 2)] = q.z;
        a[(r0, 3)] = 1.0;
        a[(r0, 8)] = -u * q.x;
        a[(r0, 9)] = -u * q.y;
        a[(r0, 10)] = -u * q.z;
        a[(r0, 11)] = -u;

        a[(r1, 4)] = q.x;
        a[(r1, 5)] = q.y;
        a[(r1, 6)] = q.z;
        a[(r1, 7)] = 1.0;
        a[(r1, 8)] = -v * q.x;
        a[(r1, 9)] = -v * q.y;
        a[(r1, 10)] = -v * q.z;
        a[(r1, 11)] = -v;
    }

    let p = null_vector(a)?;
    let mut m = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]);
    let mut t = Vector3::new(p[3], p[7], p[11]);

    // Fix the projective scale from the rotation block row norms.
    let mut s = (m.row(0).norm() + m.row(1).norm() + m.row(2).norm()) / 3.0;
    if m.determinant() < 0.0 {
        s = -s;
    }
    if s.abs() <= f64::EPSILON {
        return Err(SolveError::Degenerate);
    }
    m /= s;
    t /= s;

    let rotation = project_so3(&m)?;
    // The solve acted on q = scale*(p - centroid), so
    // x_cam ~ R*scale*p + (t - R*scale*centroid); dividing by `scale`
    // (projection is invariant to positive scaling) gives the metric pose.
    let translation = (t - rotation * (centroid * scale)) / scale;
    Ok(SE3::from_rt(rotation, translation))
}

/// Gauss-Newton refinement of the reprojection residuals in normalized
/// image coordinates, left-multiplicative se3 updates.
fn refine(points3d: &[Vector3<f64>], normalized: &[Vector2<f64>], initial: SE3) -> SE3 {
    let mut pose = initial;

    for _ in 0..GAUSS_NEWTON_ITERS {
        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = Vector6::<f64>::zeros();
        let mut valid = 0usize;

        for (p3, m) in points3d.iter().zip(normalized.iter()) {
            let pc = pose.transform_point(p3);
            if pc.z <= 1e-9 {
                continue;
            }
            valid += 1;
            let iz = 1.0 / pc.z;
            let x = pc.x * iz;
            let y = pc.y * iz;
            let r = Vector2::new(x - m.x, y - m.y);

            // d(proj)/d(p_cam)
            let dp = nalgebra::Matrix2x3::new(iz, 0.0, -x * iz, 0.0, iz, -y * iz);
            // d(p_cam)/d(xi) for xi = [v, w], left perturbation exp(xi)*T
            let mut dpc = nalgebra::Matrix3x6::zeros();
            dpc.fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&Matrix3::identity());
            dpc.fixed_view_mut::<3, 3>(0, 3).copy_from(&-skew(&pc));
            let j = dp * dpc;

            jtj += j.transpose() * j;
            jtr += j.transpose() * r;
        }

        if valid < MIN_POINTS_PLANAR {
            break;
        }
        let Some(delta) = jtj.cholesky().map(|ch| ch.solve(&(-jtr))) else {
            break;
        };
        let dv: Vector3<f64> = delta.fixed_rows::<3>(0).into_owned();
        let dw: Vector3<f64> = delta.fixed_rows::<3>(3).into_owned();
        let dr = nalgebra::UnitQuaternion::from_scaled_axis(dw);
        pose = SE3 {
            rotation: dr * pose.rotation,
            translation: dr * pose.translation + dv,
        };
        if delta.norm() < GAUSS_NEWTON_TOL {
            break;
        }
    }
    pose
}

/// Skew-symmetric matrix `[v]x` so that `[v]x u = v x u`.
#[inline]
fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Right null vector of `a` (singular vector of the smallest singular value).
fn null_vector(mut a: DMatrix<f64>) -> Result<DVector<f64>, SolveError> {
    // nalgebra's thin SVD of a wide matrix omits the right singular vectors
    // spanning the null space; pad with zero rows (AᵀA is unchanged) so v_t
    // is full and its last row is the true null vector.
    if a.nrows() < a.ncols() {
        let ncols = a.ncols();
        a = a.resize_vertically(ncols, 0.0);
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(SolveError::SvdFailed)?;
    Ok(v_t.row(v_t.nrows() - 1).transpose())
}

/// Nearest rotation matrix in the Frobenius sense.
fn project_so3(m: &Matrix3<f64>) -> Result<Matrix3<f64>, SolveError> {
    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(SolveError::SvdFailed),
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Ok(r)
}
