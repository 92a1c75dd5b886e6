//! Immutable stereo calibration results and their composition algebra.

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use camrig_mvg::extrinsics::validate_rotation;
use camrig_mvg::GeomError;
use camrig_types::Port;

use crate::Result;

/// The rigid transform taking points in the primary camera's frame to the
/// secondary camera's frame, together with the RMSE of the stereo
/// calibration that produced it.
///
/// Bootstrap output always has `primary < secondary`; inverted forms
/// (materialized during array initialization) swap the direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoPair {
    primary_port: Port,
    secondary_port: Port,
    error_score: f64,
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
}

impl StereoPair {
    pub fn new(
        primary_port: Port,
        secondary_port: Port,
        error_score: f64,
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
    ) -> Result<Self> {
        validate_rotation(&rotation)?;
        if !error_score.is_finite() || error_score < 0.0 {
            return Err(GeomError::ShapeOrInvariantViolation {
                what: format!("stereo error score {error_score} must be finite and non-negative"),
            }
            .into());
        }
        Ok(Self {
            primary_port,
            secondary_port,
            error_score,
            rotation,
            translation,
        })
    }

    #[inline]
    pub fn primary_port(&self) -> Port {
        self.primary_port
    }

    #[inline]
    pub fn secondary_port(&self) -> Port {
        self.secondary_port
    }

    #[inline]
    pub fn pair(&self) -> (Port, Port) {
        (self.primary_port, self.secondary_port)
    }

    #[inline]
    pub fn error_score(&self) -> f64 {
        self.error_score
    }

    #[inline]
    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    #[inline]
    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// The 4×4 homogeneous transform `[R t; 0 1]`.
    pub fn transformation(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Reverse the link direction: A→B becomes B→A. The error score is
    /// preserved (same measurement, opposite direction).
    pub fn invert(&self) -> StereoPair {
        let rotation = self.rotation.transpose();
        let translation = -(rotation * self.translation);
        StereoPair {
            primary_port: self.secondary_port,
            secondary_port: self.primary_port,
            error_score: self.error_score,
            rotation,
            translation,
        }
    }

    /// Extend this link through another: `(A→B).link(B→C) = A→C`.
    ///
    /// Error scores sum as a conservative bound for the composed link.
    pub fn link(&self, other: &StereoPair) -> Result<StereoPair> {
        if self.secondary_port != other.primary_port {
            return Err(GeomError::ShapeOrInvariantViolation {
                what: format!(
                    "cannot link {:?} with {:?}: endpoints do not chain",
                    self.pair(),
                    other.pair()
                ),
            }
            .into());
        }
        let rotation = other.rotation * self.rotation;
        let translation = other.rotation * self.translation + other.translation;
        Ok(StereoPair {
            primary_port: self.primary_port,
            secondary_port: other.secondary_port,
            error_score: self.error_score + other.error_score,
            rotation,
            translation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn pair(a: u8, b: u8, rvec: Vector3<f64>, t: Vector3<f64>, err: f64) -> StereoPair {
        StereoPair::new(
            Port(a),
            Port(b),
            err,
            Rotation3::new(rvec).into_inner(),
            t,
        )
        .unwrap()
    }

    #[test]
    fn invert_twice_is_identity() {
        let p = pair(
            0,
            1,
            Vector3::new(0.2, -0.4, 0.1),
            Vector3::new(100.0, -20.0, 5.0),
            0.3,
        );
        let back = p.invert().invert();
        assert_eq!(back.pair(), p.pair());
        assert_relative_eq!(back.rotation(), p.rotation(), epsilon = 1e-12);
        assert_relative_eq!(back.translation(), p.translation(), epsilon = 1e-9);
        assert_eq!(back.error_score(), p.error_score());
    }

    #[test]
    fn link_matches_homogeneous_composition() {
        let ab = pair(
            0,
            1,
            Vector3::new(0.1, 0.2, -0.3),
            Vector3::new(10.0, 0.0, 3.0),
            0.25,
        );
        let bc = pair(
            1,
            2,
            Vector3::new(-0.2, 0.05, 0.4),
            Vector3::new(-4.0, 8.0, 1.0),
            0.5,
        );
        let ac = ab.link(&bc).unwrap();
        assert_eq!(ac.pair(), (Port(0), Port(2)));
        assert_relative_eq!(ac.error_score(), 0.75);

        let expected = bc.transformation() * ab.transformation();
        assert_relative_eq!(ac.transformation(), expected, epsilon = 1e-12);
    }

    #[test]
    fn link_invert_law() {
        // (p.link(q)).invert() == q.invert().link(p.invert())
        let p = pair(
            0,
            1,
            Vector3::new(0.3, -0.1, 0.2),
            Vector3::new(50.0, 2.0, -7.0),
            0.2,
        );
        let q = pair(
            1,
            2,
            Vector3::new(0.05, 0.4, -0.2),
            Vector3::new(0.0, -30.0, 12.0),
            0.4,
        );
        let lhs = p.link(&q).unwrap().invert();
        let rhs = q.invert().link(&p.invert()).unwrap();
        assert_eq!(lhs.pair(), rhs.pair());
        assert_relative_eq!(lhs.rotation(), rhs.rotation(), epsilon = 1e-12);
        assert_relative_eq!(lhs.translation(), rhs.translation(), epsilon = 1e-9);
    }

    #[test]
    fn mismatched_link_is_rejected() {
        let p = pair(0, 1, Vector3::zeros(), Vector3::zeros(), 0.1);
        let q = pair(2, 3, Vector3::zeros(), Vector3::zeros(), 0.1);
        assert!(p.link(&q).is_err());
    }

    #[test]
    fn negative_error_score_is_rejected() {
        let r = Matrix3::identity();
        assert!(StereoPair::new(Port(0), Port(1), -0.1, r, Vector3::zeros()).is_err());
    }
}
