//! Rigid camera pose in the projection convention `x_cam = R·x_world + t`.

use nalgebra::{
    Isometry3, Matrix3, OMatrix, Point3, Rotation3, Translation3, UnitQuaternion, Vector3, U3, U4,
};
use serde::{Deserialize, Serialize};

use crate::{GeomError, Result};

const ROTATION_TOL: f64 = 1e-6;

/// Validate that `m` is a proper rotation: `‖R·Rᵀ − I‖∞ < 1e-6` and
/// `|det(R) − 1| < 1e-6`.
pub fn validate_rotation(m: &Matrix3<f64>) -> Result<()> {
    let residual = m * m.transpose() - Matrix3::identity();
    let max_abs = residual.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if max_abs >= ROTATION_TOL {
        return Err(GeomError::ShapeOrInvariantViolation {
            what: format!("rotation not orthonormal (‖R·Rᵀ−I‖∞ = {max_abs:.3e})"),
        });
    }
    let det = m.determinant();
    if (det - 1.0).abs() >= ROTATION_TOL {
        return Err(GeomError::ShapeOrInvariantViolation {
            what: format!("rotation determinant {det:.9} != +1"),
        });
    }
    Ok(())
}

/// Camera pose: rotation mapping world→camera and the world origin expressed
/// in the camera frame (mm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraExtrinsics {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl CameraExtrinsics {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Result<Self> {
        validate_rotation(&rotation)?;
        Ok(Self {
            rotation,
            translation,
        })
    }

    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a Rodrigues (scaled axis-angle) vector and translation, the
    /// form the bundle adjuster optimizes.
    pub fn from_rodrigues(rvec: Vector3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = Rotation3::new(rvec).into_inner();
        Self {
            rotation,
            translation,
        }
    }

    #[inline]
    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    #[inline]
    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// The Rodrigues vector of the stored (world→camera) rotation.
    pub fn rodrigues(&self) -> Vector3<f64> {
        Rotation3::from_matrix_unchecked(self.rotation).scaled_axis()
    }

    /// Camera center in world coordinates: `-Rᵀ·t`.
    pub fn camera_center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.transpose() * self.translation))
    }

    /// The world→camera rigid transform as an isometry.
    pub fn pose(&self) -> Isometry3<f64> {
        let rquat = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(
            self.rotation,
        ));
        Isometry3::from_parts(Translation3::from(self.translation), rquat)
    }

    /// Interop with the `cam-geom` pose type used for projection.
    pub fn to_cam_geom(&self) -> cam_geom::ExtrinsicParameters<f64> {
        cam_geom::ExtrinsicParameters::from_pose(&self.pose())
    }

    /// The 3×4 matrix `[R | t]`.
    pub fn matrix3x4(&self) -> OMatrix<f64, U3, U4> {
        let mut m = OMatrix::<f64, U3, U4>::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn transform_point(&self, world: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * world.coords + self.translation)
    }
}
