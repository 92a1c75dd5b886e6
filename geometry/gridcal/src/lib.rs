//! Per-camera intrinsic calibration from planar grid observations.
//!
//! The calibration target is a planar grid with known local coordinates
//! (z = 0). Views are admitted through [`ViewCollector`] (corner-count and
//! spacing thresholds), a closed-form estimate of the camera matrix is taken
//! from the view homographies, and the full model (focal lengths, principal
//! point, 5 distortion coefficients, per-view poses) is refined with a
//! Levenberg-Marquardt pass over the reprojection residuals.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Owned, Point2, Point3, Vector3};

use camrig_mvg::extrinsics::CameraExtrinsics;
use camrig_mvg::homography::{homography_dlt, planar_pose, smallest_right_singular_vector};
use camrig_mvg::CameraIntrinsics;
use camrig_types::{FramePacket, Port};

mod collector;
pub use collector::{BoardView, ViewCollector};

#[derive(thiserror::Error, Debug)]
pub enum GridCalError {
    #[error("insufficient observations: {what}")]
    InsufficientObservations { what: String },
    #[error("intrinsic fit inadequate for port {port}: RMSE {rmse:.3} px")]
    IntrinsicFitInadequate { port: Port, rmse: f64 },
    #[error(transparent)]
    Geom(#[from] camrig_mvg::GeomError),
}

pub type Result<T> = std::result::Result<T, GridCalError>;

const N_INTRINSIC_PARAMS: usize = 9; // fx, fy, cx, cy, k1, k2, p1, p2, k3
const N_POSE_PARAMS: usize = 6;

#[derive(Debug, Clone)]
pub struct IntrinsicConfig {
    /// Maximum acceptable reprojection RMSE, in pixels.
    pub epsilon_intrinsic: f64,
    pub ftol: f64,
    pub max_iterations: usize,
}

impl Default for IntrinsicConfig {
    fn default() -> Self {
        Self {
            epsilon_intrinsic: 1.0,
            ftol: 1e-8,
            max_iterations: 100,
        }
    }
}

/// Result of a successful intrinsic calibration.
#[derive(Debug, Clone)]
pub struct IntrinsicFit {
    pub intrinsics: CameraIntrinsics,
    /// Reprojection RMSE on the training views, in pixels.
    pub rmse: f64,
    /// Number of board views used.
    pub grid_count: u32,
}

/// Calibrate one camera from its accepted board views.
pub fn calibrate(
    port: Port,
    width: usize,
    height: usize,
    views: &[BoardView],
    cfg: &IntrinsicConfig,
) -> Result<IntrinsicFit> {
    if views.len() < 3 {
        return Err(GridCalError::InsufficientObservations {
            what: format!("{} board views for port {port}, need at least 3", views.len()),
        });
    }

    let homographies: Vec<Matrix3<f64>> = views
        .iter()
        .map(|v| homography_dlt(&v.obj_xy(), &v.img_loc))
        .collect::<camrig_mvg::Result<_>>()?;

    let k_init = closed_form_camera_matrix(&homographies)?;
    tracing::debug!(
        "port {port}: closed-form init fx={:.1} fy={:.1} cx={:.1} cy={:.1}",
        k_init[(0, 0)],
        k_init[(1, 1)],
        k_init[(0, 2)],
        k_init[(1, 2)]
    );

    let poses = initial_poses(&k_init, views)?;

    let problem = PlanarCalibration::new(&k_init, poses, views);
    let (problem, report) = LevenbergMarquardt::new()
        .with_ftol(cfg.ftol)
        .with_patience(cfg.max_iterations)
        .minimize(problem);
    if !report.termination.was_successful() {
        tracing::warn!("port {port}: intrinsic refinement terminated with {:?}", report.termination);
    }

    let rmse = problem.rmse();
    if rmse > cfg.epsilon_intrinsic {
        return Err(GridCalError::IntrinsicFitInadequate { port, rmse });
    }

    let (matrix, distortions) = problem.unpack_intrinsics();
    Ok(IntrinsicFit {
        intrinsics: CameraIntrinsics::from_matrix_and_distortions(
            width,
            height,
            &matrix,
            &distortions,
        ),
        rmse,
        grid_count: views.len() as u32,
    })
}

/// Admit frames through the collector until exhausted, then calibrate.
pub fn calibrate_from_packets<'a>(
    port: Port,
    width: usize,
    height: usize,
    packets: impl Iterator<Item = &'a FramePacket>,
    collector: &mut ViewCollector,
    cfg: &IntrinsicConfig,
) -> Result<IntrinsicFit> {
    for packet in packets {
        collector.offer(packet);
    }
    calibrate(port, width, height, collector.views(), cfg)
}

/// Zhang's closed-form solution for the camera matrix from a set of board
/// homographies, assuming zero skew.
fn closed_form_camera_matrix(homographies: &[Matrix3<f64>]) -> Result<Matrix3<f64>> {
    let v_ij = |h: &Matrix3<f64>, i: usize, j: usize| -> [f64; 6] {
        [
            h[(0, i)] * h[(0, j)],
            h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
            h[(1, i)] * h[(1, j)],
            h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
            h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
            h[(2, i)] * h[(2, j)],
        ]
    };

    let mut v = DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (n, h) in homographies.iter().enumerate() {
        let v12 = v_ij(h, 0, 1);
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        for c in 0..6 {
            v[(2 * n, c)] = v12[c];
            v[(2 * n + 1, c)] = v11[c] - v22[c];
        }
    }

    let mut b = smallest_right_singular_vector(v)
        .map_err(|_| GridCalError::InsufficientObservations {
            what: "absolute-conic system is rank deficient".to_string(),
        })?;
    // B must be positive definite up to sign
    if b[0] < 0.0 {
        b = -b;
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let cy = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + cy * (b12 * b13 - b11 * b23)) / b11;
    if lambda / b11 <= 0.0 || lambda * b11 / denom <= 0.0 {
        return Err(GridCalError::InsufficientObservations {
            what: "degenerate view geometry (board orientations too similar)".to_string(),
        });
    }
    let fx = (lambda / b11).sqrt();
    let fy = (lambda * b11 / denom).sqrt();
    let cx = -b13 * fx * fx / lambda;

    Ok(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
}

fn initial_poses(k: &Matrix3<f64>, views: &[BoardView]) -> Result<Vec<CameraExtrinsics>> {
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    views
        .iter()
        .map(|view| {
            let normalized: Vec<Point2<f64>> = view
                .img_loc
                .iter()
                .map(|p| Point2::new((p.x - cx) / fx, (p.y - cy) / fy))
                .collect();
            planar_pose(&view.obj_xy(), &normalized).map_err(GridCalError::from)
        })
        .collect()
}

/// Distorted pinhole projection with explicit parameters, used inside the
/// refinement loop.
fn project_distorted(
    intr: &[f64; N_INTRINSIC_PARAMS],
    pose: &CameraExtrinsics,
    obj: &Point3<f64>,
) -> Point2<f64> {
    let [fx, fy, cx, cy, k1, k2, p1, p2, k3] = *intr;
    let cam = pose.transform_point(obj);
    let xn = cam.x / cam.z;
    let yn = cam.y / cam.z;
    let r2 = xn * xn + yn * yn;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
    let xd = xn * radial + 2.0 * p1 * xn * yn + p2 * (r2 + 2.0 * xn * xn);
    let yd = yn * radial + p1 * (r2 + 2.0 * yn * yn) + 2.0 * p2 * xn * yn;
    Point2::new(fx * xd + cx, fy * yd + cy)
}

/// Joint refinement problem: intrinsics + distortion + per-view poses.
struct PlanarCalibration {
    views: Vec<BoardView>,
    nresid: usize,
    params_cache: DVector<f64>,
}

impl PlanarCalibration {
    fn new(k_init: &Matrix3<f64>, poses: Vec<CameraExtrinsics>, views: &[BoardView]) -> Self {
        let mut params = Vec::with_capacity(N_INTRINSIC_PARAMS + N_POSE_PARAMS * poses.len());
        params.extend([
            k_init[(0, 0)],
            k_init[(1, 1)],
            k_init[(0, 2)],
            k_init[(1, 2)],
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
        ]);
        for pose in poses.iter() {
            let r = pose.rodrigues();
            let t = pose.translation();
            params.extend([r.x, r.y, r.z, t.x, t.y, t.z]);
        }
        let nresid = 2 * views.iter().map(|v| v.len()).sum::<usize>();
        Self {
            views: views.to_vec(),
            nresid,
            params_cache: DVector::from_vec(params),
        }
    }

    fn intrinsic_params(&self) -> [f64; N_INTRINSIC_PARAMS] {
        let mut out = [0.0; N_INTRINSIC_PARAMS];
        out.copy_from_slice(&self.params_cache.as_slice()[..N_INTRINSIC_PARAMS]);
        out
    }

    fn pose(&self, view_idx: usize) -> CameraExtrinsics {
        let base = N_INTRINSIC_PARAMS + N_POSE_PARAMS * view_idx;
        let p = self.params_cache.as_slice();
        CameraExtrinsics::from_rodrigues(
            Vector3::new(p[base], p[base + 1], p[base + 2]),
            Vector3::new(p[base + 3], p[base + 4], p[base + 5]),
        )
    }

    fn residuals_into(&self, params: &DVector<f64>, out: &mut DVector<f64>) {
        let mut intr = [0.0; N_INTRINSIC_PARAMS];
        intr.copy_from_slice(&params.as_slice()[..N_INTRINSIC_PARAMS]);
        let mut row = 0;
        for (view_idx, view) in self.views.iter().enumerate() {
            let base = N_INTRINSIC_PARAMS + N_POSE_PARAMS * view_idx;
            let p = params.as_slice();
            let pose = CameraExtrinsics::from_rodrigues(
                Vector3::new(p[base], p[base + 1], p[base + 2]),
                Vector3::new(p[base + 3], p[base + 4], p[base + 5]),
            );
            for (obj, img) in view.obj_loc.iter().zip(view.img_loc.iter()) {
                let predicted = project_distorted(&intr, &pose, obj);
                out[row] = predicted.x - img.x;
                out[row + 1] = predicted.y - img.y;
                row += 2;
            }
        }
        debug_assert_eq!(row, self.nresid);
    }

    fn rmse(&self) -> f64 {
        let mut r = DVector::zeros(self.nresid);
        self.residuals_into(&self.params_cache, &mut r);
        let n_obs = self.nresid / 2;
        let mut sq = 0.0;
        for i in 0..n_obs {
            sq += r[2 * i] * r[2 * i] + r[2 * i + 1] * r[2 * i + 1];
        }
        (sq / n_obs as f64).sqrt()
    }

    fn unpack_intrinsics(&self) -> (Matrix3<f64>, [f64; 5]) {
        let [fx, fy, cx, cy, k1, k2, p1, p2, k3] = self.intrinsic_params();
        (
            Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0),
            [k1, k2, p1, p2, k3],
        )
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PlanarCalibration {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params_cache = x.clone();
    }

    fn params(&self) -> DVector<f64> {
        self.params_cache.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut out = DVector::zeros(self.nresid);
        self.residuals_into(&self.params_cache, &mut out);
        Some(out)
    }

    fn jacobian(&self) -> Option<nalgebra::OMatrix<f64, Dyn, Dyn>> {
        let nparams = self.params_cache.len();
        let mut j = nalgebra::OMatrix::<f64, Dyn, Dyn>::zeros(self.nresid, nparams);

        let mut plus = DVector::zeros(self.nresid);
        let mut minus = DVector::zeros(self.nresid);
        for col in 0..nparams {
            let step = 1e-6 * self.params_cache[col].abs().max(1.0);
            let mut p = self.params_cache.clone();
            p[col] += step;
            self.residuals_into(&p, &mut plus);
            p[col] -= 2.0 * step;
            self.residuals_into(&p, &mut minus);

            // pose columns only touch their own view's rows; the zero
            // difference elsewhere keeps this correct if wasteful
            for row in 0..self.nresid {
                j[(row, col)] = (plus[row] - minus[row]) / (2.0 * step);
            }
        }
        Some(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use camrig_mvg::camera::CameraData;
    use nalgebra::Rotation3;

    fn truth_intrinsics() -> CameraIntrinsics {
        let matrix = Matrix3::new(820.0, 0.0, 950.0, 0.0, 810.0, 530.0, 0.0, 0.0, 1.0);
        CameraIntrinsics::from_matrix_and_distortions(
            1920,
            1080,
            &matrix,
            &[0.08, -0.15, 0.001, -0.0005, 0.03],
        )
    }

    fn synth_views(intrinsics: &CameraIntrinsics, n: usize) -> Vec<BoardView> {
        let mut cam = CameraData::new(Port(0), intrinsics.clone());
        let board: Vec<Point3<f64>> = (0..7)
            .flat_map(|row| {
                (0..9).map(move |col| {
                    Point3::new(f64::from(col) * 40.0, f64::from(row) * 40.0, 0.0)
                })
            })
            .collect();

        (0..n)
            .map(|i| {
                let kf = i as f64;
                let rot = Rotation3::new(Vector3::new(
                    0.35 * (kf * 0.9).sin(),
                    0.35 * (kf * 1.3).cos(),
                    0.1 * kf,
                ))
                .into_inner();
                let t = Vector3::new(
                    -160.0 + 18.0 * kf,
                    -120.0 + 9.0 * kf,
                    700.0 + 35.0 * kf,
                );
                cam.extrinsics = Some(CameraExtrinsics::new(rot, t).unwrap());
                let img_loc: Vec<Point2<f64>> =
                    board.iter().map(|p| cam.project(p).unwrap()).collect();
                BoardView {
                    obj_loc: board.clone(),
                    img_loc,
                    frame_time: kf,
                }
            })
            .collect()
    }

    #[test]
    fn recovers_known_intrinsics() {
        let truth = truth_intrinsics();
        let views = synth_views(&truth, 8);
        let fit = calibrate(Port(0), 1920, 1080, &views, &IntrinsicConfig::default()).unwrap();

        assert!(fit.rmse < 1e-4, "rmse {} too large", fit.rmse);
        assert_eq!(fit.grid_count, 8);
        let k_est = fit.intrinsics.matrix();
        let k_true = truth.matrix();
        assert_relative_eq!(k_est[(0, 0)], k_true[(0, 0)], epsilon = 0.5);
        assert_relative_eq!(k_est[(1, 1)], k_true[(1, 1)], epsilon = 0.5);
        assert_relative_eq!(k_est[(0, 2)], k_true[(0, 2)], epsilon = 0.5);
        assert_relative_eq!(k_est[(1, 2)], k_true[(1, 2)], epsilon = 0.5);

        let d_est = fit.intrinsics.distortions();
        let d_true = truth.distortions();
        for (e, t) in d_est.iter().zip(d_true.iter()) {
            assert_relative_eq!(e, t, epsilon = 1e-3);
        }
    }

    #[test]
    fn inadequate_fit_is_reported() {
        let truth = truth_intrinsics();
        let views = synth_views(&truth, 8);
        let cfg = IntrinsicConfig {
            epsilon_intrinsic: 0.0,
            ..Default::default()
        };
        match calibrate(Port(3), 1920, 1080, &views, &cfg) {
            Err(GridCalError::IntrinsicFitInadequate { port, .. }) => assert_eq!(port, Port(3)),
            other => panic!("expected IntrinsicFitInadequate, got {other:?}"),
        }
    }

    #[test]
    fn too_few_views_is_an_error() {
        let truth = truth_intrinsics();
        let views = synth_views(&truth, 2);
        assert!(matches!(
            calibrate(Port(0), 1920, 1080, &views, &IntrinsicConfig::default()),
            Err(GridCalError::InsufficientObservations { .. })
        ));
    }
}
