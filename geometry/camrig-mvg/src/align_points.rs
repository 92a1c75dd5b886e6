//! Kabsch-Umeyama similarity alignment between corresponding point sets.
//!
//! Used for gauge fixing: the solved world frame is aligned to the known
//! object coordinates of the calibration target at a reference sync index.

use nalgebra::{Matrix3, Point3, Vector3, SVD};
use serde::{Deserialize, Serialize};

use crate::{GeomError, Result};

/// `x' = s·R·x + t`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityTransform {
    pub scale: f64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn apply(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.scale * (self.rotation * p.coords) + self.translation)
    }
}

/// Find the similarity transform that best maps `moving` onto `fixed` in the
/// least-squares sense (closed form via SVD on the centered covariance, with
/// Umeyama scaling and reflection correction).
pub fn align_points(moving: &[Point3<f64>], fixed: &[Point3<f64>]) -> Result<SimilarityTransform> {
    if moving.len() != fixed.len() {
        return Err(GeomError::ShapeOrInvariantViolation {
            what: format!(
                "point set size mismatch: {} vs {}",
                moving.len(),
                fixed.len()
            ),
        });
    }
    if moving.len() < 3 {
        return Err(GeomError::InsufficientObservations {
            what: format!("{} correspondences, need at least 3", moving.len()),
        });
    }
    let n = moving.len() as f64;

    let mu_x: Vector3<f64> = moving.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;
    let mu_y: Vector3<f64> = fixed.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;

    let mut sigma = Matrix3::<f64>::zeros();
    let mut var_x = 0.0;
    for (x, y) in moving.iter().zip(fixed.iter()) {
        let xc = x.coords - mu_x;
        let yc = y.coords - mu_y;
        sigma += yc * xc.transpose();
        var_x += xc.norm_squared();
    }
    sigma /= n;
    var_x /= n;
    if var_x <= 0.0 {
        return Err(GeomError::ShapeOrInvariantViolation {
            what: "degenerate moving point set (zero variance)".to_string(),
        });
    }

    let svd = SVD::new(sigma, true, true);
    let u = svd.u.ok_or(GeomError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(GeomError::SvdFailed)?;
    let d = svd.singular_values;

    let mut s_fix = Vector3::new(1.0, 1.0, 1.0);
    if (u.determinant() * v_t.determinant()) < 0.0 {
        s_fix[2] = -1.0;
    }

    let rotation = u * Matrix3::from_diagonal(&s_fix) * v_t;
    let scale = (d[0] * s_fix[0] + d[1] * s_fix[1] + d[2] * s_fix[2]) / var_x;
    let translation = mu_y - scale * (rotation * mu_x);

    Ok(SimilarityTransform {
        scale,
        rotation,
        translation,
    })
}
