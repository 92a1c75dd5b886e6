//! Per-camera calibration state: intrinsics, distortion, and pose.

use nalgebra::{Matrix3, Point2, Point3, RowVector3, Vector5};
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics};
use serde::{Deserialize, Serialize};

use camrig_types::Port;

use crate::extrinsics::CameraExtrinsics;
use crate::{GeomError, Result};

/// Intrinsic camera model: image size plus the OpenCV-compatible pinhole +
/// radial-tangential distortion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    width: usize,
    height: usize,
    inner: RosOpenCvIntrinsics<f64>,
}

impl CameraIntrinsics {
    pub fn new(width: usize, height: usize, inner: RosOpenCvIntrinsics<f64>) -> Self {
        Self {
            width,
            height,
            inner,
        }
    }

    /// Build from the serialized form: a 3×3 camera matrix and the 5-vector
    /// `[k1, k2, p1, p2, k3]`.
    pub fn from_matrix_and_distortions(
        width: usize,
        height: usize,
        matrix: &Matrix3<f64>,
        distortions: &[f64; 5],
    ) -> Self {
        let dist = Distortion::from_opencv_vec(Vector5::new(
            distortions[0],
            distortions[1],
            distortions[2],
            distortions[3],
            distortions[4],
        ));
        let inner = RosOpenCvIntrinsics::from_params_with_distortion(
            matrix[(0, 0)],
            matrix[(0, 1)],
            matrix[(1, 1)],
            matrix[(0, 2)],
            matrix[(1, 2)],
            dist,
        );
        Self {
            width,
            height,
            inner,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn inner(&self) -> &RosOpenCvIntrinsics<f64> {
        &self.inner
    }

    /// The 3×3 camera matrix K.
    pub fn matrix(&self) -> Matrix3<f64> {
        self.inner.k
    }

    /// Distortion coefficients `[k1, k2, p1, p2, k3]`.
    pub fn distortions(&self) -> [f64; 5] {
        let v = self.inner.distortion.opencv_vec();
        [v[0], v[1], v[2], v[3], v[4]]
    }

    /// Remove lens distortion from a raw pixel observation using the
    /// iterative inverse-distortion scheme.
    pub fn undistort(&self, distorted: &Point2<f64>) -> Point2<f64> {
        let pix = cam_geom::Pixels {
            data: nalgebra::Matrix1x2::new(distorted.x, distorted.y),
        };
        let und = self.inner.undistort(&pix);
        Point2::new(und.data[(0, 0)], und.data[(0, 1)])
    }

    /// Apply lens distortion to an ideal (pinhole) pixel location.
    pub fn distort(&self, undistorted: &Point2<f64>) -> Point2<f64> {
        let und = opencv_ros_camera::UndistortedPixels {
            data: nalgebra::Matrix1x2::new(undistorted.x, undistorted.y),
        };
        let pix = self.inner.distort(&und);
        Point2::new(pix.data[(0, 0)], pix.data[(0, 1)])
    }
}

/// Everything the session knows about one camera: identity, calibration, and
/// the per-camera bookkeeping persisted in `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraData {
    pub port: Port,
    pub intrinsics: CameraIntrinsics,
    pub extrinsics: Option<CameraExtrinsics>,
    /// Discrete image rotation applied upstream, in quarter turns (-3..=3).
    pub rotation_count: i8,
    pub exposure: Option<i64>,
    /// RMSE of the intrinsic fit, in pixels.
    pub error: Option<f64>,
    /// Number of board views accepted during intrinsic calibration.
    pub grid_count: Option<u32>,
    pub ignore: bool,
    pub verified_resolutions: Vec<(u32, u32)>,
}

impl CameraData {
    pub fn new(port: Port, intrinsics: CameraIntrinsics) -> Self {
        Self {
            port,
            intrinsics,
            extrinsics: None,
            rotation_count: 0,
            exposure: None,
            error: None,
            grid_count: None,
            ignore: false,
            verified_resolutions: Vec::new(),
        }
    }

    pub fn extrinsics(&self) -> Result<&CameraExtrinsics> {
        self.extrinsics
            .as_ref()
            .ok_or(GeomError::MissingExtrinsics(self.port))
    }

    /// The projection camera used for reprojection math. Rebuilding this is
    /// cheap; callers in tight loops (the bundle adjuster) cache it.
    pub fn projection_camera(&self) -> Result<cam_geom::Camera<f64, RosOpenCvIntrinsics<f64>>> {
        let e = self.extrinsics()?;
        Ok(cam_geom::Camera::new(
            self.intrinsics.inner().clone(),
            e.to_cam_geom(),
        ))
    }

    /// Project a world point to raw (distorted) pixel coordinates.
    pub fn project(&self, world: &Point3<f64>) -> Result<Point2<f64>> {
        let cam = self.projection_camera()?;
        Ok(project_world_point(&cam, world))
    }
}

/// Project a world point through explicit intrinsics and pose to raw
/// (distorted) pixel coordinates, without building a projection camera.
pub fn project_pinhole_distorted(
    intrinsics: &CameraIntrinsics,
    pose: &crate::extrinsics::CameraExtrinsics,
    world: &Point3<f64>,
) -> Point2<f64> {
    let cam = pose.transform_point(world);
    let k = intrinsics.matrix();
    let u = k[(0, 0)] * cam.x / cam.z + k[(0, 1)] * cam.y / cam.z + k[(0, 2)];
    let v = k[(1, 1)] * cam.y / cam.z + k[(1, 2)];
    intrinsics.distort(&Point2::new(u, v))
}

/// Project one world point through a cached projection camera.
pub fn project_world_point(
    cam: &cam_geom::Camera<f64, RosOpenCvIntrinsics<f64>>,
    world: &Point3<f64>,
) -> Point2<f64> {
    let pts = cam_geom::Points::new(RowVector3::new(world.x, world.y, world.z));
    let predicted = cam.world_to_pixel(&pts).data.transpose();
    Point2::new(predicted.x, predicted.y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn intrinsics_with_distortion() -> CameraIntrinsics {
        let matrix = Matrix3::new(800.0, 0.0, 960.0, 0.0, 800.0, 540.0, 0.0, 0.0, 1.0);
        CameraIntrinsics::from_matrix_and_distortions(
            1920,
            1080,
            &matrix,
            &[0.1, -0.02, 0.001, -0.001, 0.005],
        )
    }

    #[test]
    fn matrix_and_distortions_round_trip() {
        let i = intrinsics_with_distortion();
        let k = i.matrix();
        assert_relative_eq!(k[(0, 0)], 800.0);
        assert_relative_eq!(k[(0, 2)], 960.0);
        assert_relative_eq!(k[(1, 2)], 540.0);
        assert_eq!(i.distortions(), [0.1, -0.02, 0.001, -0.001, 0.005]);
    }

    #[test]
    fn undistort_inverts_distort() {
        let i = intrinsics_with_distortion();
        let ideal = Point2::new(1100.0, 600.0);
        let raw = i.distort(&ideal);
        let back = i.undistort(&raw);
        assert_relative_eq!(back, ideal, epsilon = 1e-6);
    }

    #[test]
    fn projection_matches_manual_pinhole() {
        let matrix = Matrix3::new(800.0, 0.0, 960.0, 0.0, 800.0, 540.0, 0.0, 0.0, 1.0);
        let intrinsics =
            CameraIntrinsics::from_matrix_and_distortions(1920, 1080, &matrix, &[0.0; 5]);
        let mut cam = CameraData::new(Port(0), intrinsics);
        cam.extrinsics = Some(CameraExtrinsics::from_rodrigues(
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, 0.0),
        ));

        let world = Point3::new(100.0, -50.0, 1000.0);
        let px = cam.project(&world).unwrap();
        assert_relative_eq!(px.x, 960.0 + 800.0 * 100.0 / 1000.0, epsilon = 1e-9);
        assert_relative_eq!(px.y, 540.0 + 800.0 * -50.0 / 1000.0, epsilon = 1e-9);
    }
}
