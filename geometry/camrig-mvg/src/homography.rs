//! Planar homography estimation and pose-from-homography.
//!
//! These routines are the planar workhorses behind intrinsic calibration and
//! the stereo bootstrap: a Hartley-normalized DLT homography from board
//! coordinates to image coordinates, and its decomposition into a rigid
//! board pose when the image points are expressed in K-normalized
//! (undistorted, unit-focal) coordinates.

use nalgebra::{DMatrix, Matrix3, Point2, Vector3, SVD};

use crate::extrinsics::CameraExtrinsics;
use crate::{GeomError, Result};

/// Isotropic normalization moving the centroid to the origin with mean
/// distance sqrt(2).
fn normalization(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 0.0 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Estimate the homography `dst ≈ H·src` (homogeneous) from ≥4
/// correspondences via the normalized DLT.
pub fn homography_dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() {
        return Err(GeomError::ShapeOrInvariantViolation {
            what: format!("correspondence count mismatch: {} vs {}", src.len(), dst.len()),
        });
    }
    if src.len() < 4 {
        return Err(GeomError::InsufficientObservations {
            what: format!("{} correspondences, homography needs at least 4", src.len()),
        });
    }

    let t_src = normalization(src);
    let t_dst = normalization(dst);
    let norm = |t: &Matrix3<f64>, p: &Point2<f64>| {
        let v = t * Vector3::new(p.x, p.y, 1.0);
        Point2::new(v.x / v.z, v.y / v.z)
    };

    let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
    for (i, (ps, pd)) in src.iter().zip(dst.iter()).enumerate() {
        let s = norm(&t_src, ps);
        let d = norm(&t_dst, pd);
        let r = 2 * i;
        a[(r, 0)] = -s.x;
        a[(r, 1)] = -s.y;
        a[(r, 2)] = -1.0;
        a[(r, 6)] = d.x * s.x;
        a[(r, 7)] = d.x * s.y;
        a[(r, 8)] = d.x;
        a[(r + 1, 3)] = -s.x;
        a[(r + 1, 4)] = -s.y;
        a[(r + 1, 5)] = -1.0;
        a[(r + 1, 6)] = d.y * s.x;
        a[(r + 1, 7)] = d.y * s.y;
        a[(r + 1, 8)] = d.y;
    }

    let h_norm = smallest_right_singular_vector(a)?;
    let h_norm = Matrix3::from_row_slice(h_norm.as_slice());

    // undo normalization
    let t_dst_inv = t_dst.try_inverse().ok_or(GeomError::SvdFailed)?;
    let mut h = t_dst_inv * h_norm * t_src;
    if h[(2, 2)].abs() > f64::EPSILON {
        h /= h[(2, 2)];
    }
    Ok(h)
}

/// The right-singular vector of `a` with the smallest singular value.
pub fn smallest_right_singular_vector(a: DMatrix<f64>) -> Result<nalgebra::DVector<f64>> {
    let ncols = a.ncols();
    let svd = SVD::new(a, false, true);
    let v_t = svd.v_t.as_ref().ok_or(GeomError::SvdFailed)?;
    // nalgebra orders singular values descending; the null direction is the
    // last row of Vᵀ.
    let mut min_idx = 0;
    let mut min_sv = f64::INFINITY;
    for (i, sv) in svd.singular_values.iter().enumerate() {
        if *sv < min_sv {
            min_sv = *sv;
            min_idx = i;
        }
    }
    let row = v_t.row(min_idx);
    Ok(nalgebra::DVector::from_iterator(ncols, row.iter().copied()))
}

/// Recover the rigid pose of a planar (z = 0) target from the homography
/// mapping board coordinates (mm) to K-normalized image coordinates.
///
/// Returns extrinsics with `x_cam = R·x_board + t` and the target in front of
/// the camera (`t.z > 0`).
pub fn planar_pose(
    obj_xy: &[Point2<f64>],
    img_normalized: &[Point2<f64>],
) -> Result<CameraExtrinsics> {
    let h = homography_dlt(obj_xy, img_normalized)?;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let mut lambda = 2.0 / (h1.norm() + h2.norm());
    // the target must be in front of the camera
    if lambda * h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = lambda * h1;
    let r2 = lambda * h2;
    let r3 = r1.cross(&r2);
    let rough = Matrix3::from_columns(&[r1, r2, r3]);

    // nearest proper rotation
    let svd = SVD::new(rough, true, true);
    let u = svd.u.ok_or(GeomError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(GeomError::SvdFailed)?;
    let mut s_fix = Matrix3::identity();
    if (u.determinant() * v_t.determinant()) < 0.0 {
        s_fix[(2, 2)] = -1.0;
    }
    let rotation = u * s_fix * v_t;
    let translation = lambda * h3;

    CameraExtrinsics::new(rotation, translation)
}
