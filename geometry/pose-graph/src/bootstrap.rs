//! Relative-pose estimation for camera pairs from co-observed boards.

use std::collections::BTreeMap;

use itertools::Itertools;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DVector, Dyn, Owned, Point2, Point3, Rotation3, UnitQuaternion, Vector3};

use camrig_mvg::camera::{project_pinhole_distorted, CameraData};
use camrig_mvg::extrinsics::CameraExtrinsics;
use camrig_mvg::homography::planar_pose;
use camrig_mvg::CameraArray;
use camrig_types::{ImagePoints, Port};

use crate::stereo_pair::StereoPair;
use crate::{PoseGraphError, Result};

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Minimum number of sync indices in which both cameras saw enough
    /// common corners.
    pub min_shared_boards: usize,
    /// Minimum common corners per shared frame.
    pub min_common_corners: usize,
    /// Frames whose single-view board pose misfits worse than this (mean
    /// pixels) are excluded; near-edge-on views of the board produce
    /// degenerate planar poses.
    pub max_board_pose_error: f64,
    pub ftol: f64,
    pub max_iterations: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            min_shared_boards: 10,
            min_common_corners: 4,
            max_board_pose_error: 10.0,
            ftol: 1e-10,
            max_iterations: 60,
        }
    }
}

/// One co-observed board: its pose in both cameras plus the matched
/// observations.
struct SharedBoard {
    pose_primary: CameraExtrinsics,
    pose_secondary: CameraExtrinsics,
    obj: Vec<Point3<f64>>,
    img_primary: Vec<Point2<f64>>,
    img_secondary: Vec<Point2<f64>>,
}

/// Estimate relative poses for every qualifying unordered pair in the array.
/// Pairs below the shared-board threshold are omitted with a log line.
pub fn stereo_calibrate_pairs(
    array: &CameraArray,
    image_points: &ImagePoints,
    cfg: &BootstrapConfig,
) -> Vec<StereoPair> {
    let ports: Vec<Port> = array
        .iter()
        .filter(|(_, cam)| !cam.ignore)
        .map(|(port, _)| *port)
        .collect();

    let mut pairs = Vec::new();
    for (a, b) in ports.iter().copied().tuple_combinations() {
        match stereo_calibrate_pair(array, image_points, a, b, cfg) {
            Ok(pair) => {
                tracing::info!(
                    "stereo pair ({a}, {b}): RMSE {:.3} px",
                    pair.error_score()
                );
                pairs.push(pair);
            }
            Err(err) => {
                tracing::debug!("skipping pair ({a}, {b}): {err}");
            }
        }
    }
    pairs
}

/// Estimate the relative pose of `b` with respect to `a` (`a < b`).
pub fn stereo_calibrate_pair(
    array: &CameraArray,
    image_points: &ImagePoints,
    a: Port,
    b: Port,
    cfg: &BootstrapConfig,
) -> Result<StereoPair> {
    assert!(a < b, "stereo pairs are keyed primary < secondary");
    let cam_a = array.require(a)?;
    let cam_b = array.require(b)?;

    let boards = shared_boards(cam_a, cam_b, image_points, cfg)?;
    if boards.len() < cfg.min_shared_boards {
        return Err(PoseGraphError::StereoPairBelowThreshold {
            pair: (a, b),
            shared_boards: boards.len(),
        });
    }

    // Per-frame relative poses, averaged for the refinement seed.
    let mut quat_sum = nalgebra::Vector4::<f64>::zeros();
    let mut t_sum = Vector3::zeros();
    let mut reference: Option<UnitQuaternion<f64>> = None;
    for board in boards.iter() {
        let pose_b = &board.pose_secondary;
        let rel_r = pose_b.rotation() * board.pose_primary.rotation().transpose();
        let rel_t = pose_b.translation() - rel_r * board.pose_primary.translation();

        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rel_r));
        let reference = reference.get_or_insert(q);
        let mut coords = q.as_ref().coords;
        if reference.as_ref().coords.dot(&coords) < 0.0 {
            coords = -coords;
        }
        quat_sum += coords;
        t_sum += rel_t;
    }
    let n = boards.len() as f64;
    let mean_q = UnitQuaternion::from_quaternion(nalgebra::Quaternion {
        coords: quat_sum / n,
    });
    let seed = CameraExtrinsics::from_rodrigues(mean_q.scaled_axis(), t_sum / n);

    // Refine the 6-DoF relative pose against secondary-view reprojection.
    let problem = RelativePoseProblem {
        cam_b: cam_b.clone(),
        boards: &boards,
        params_cache: {
            let r = seed.rodrigues();
            let t = seed.translation();
            DVector::from_vec(vec![r.x, r.y, r.z, t.x, t.y, t.z])
        },
    };
    let (problem, report) = LevenbergMarquardt::new()
        .with_ftol(cfg.ftol)
        .with_patience(cfg.max_iterations)
        .minimize(problem);
    if !report.termination.was_successful() {
        tracing::warn!(
            "relative pose refinement for ({a}, {b}) terminated with {:?}",
            report.termination
        );
    }
    let refined = problem.relative_pose();

    let error_score = stereo_rmse(cam_a, cam_b, &refined, &boards);
    Ok(StereoPair::new(
        a,
        b,
        error_score,
        *refined.rotation(),
        *refined.translation(),
    )?)
}

/// Collect sync indices where both cameras observed enough common corners,
/// with the board pose solved in the primary camera. Frames whose planar
/// pose misfits either view are excluded as degenerate.
fn shared_boards(
    cam_a: &CameraData,
    cam_b: &CameraData,
    image_points: &ImagePoints,
    cfg: &BootstrapConfig,
) -> Result<Vec<SharedBoard>> {
    let grouped = image_points.by_sync_and_port();
    let mut boards = Vec::new();
    for (sync_index, by_port) in grouped.iter() {
        let (Some(rows_a), Some(rows_b)) = (by_port.get(&cam_a.port), by_port.get(&cam_b.port))
        else {
            continue;
        };
        let in_a: BTreeMap<u32, &camrig_types::ImagePoint> = rows_a
            .iter()
            .filter(|r| r.obj_loc().is_some())
            .map(|r| (r.point_id, *r))
            .collect();

        let mut obj = Vec::new();
        let mut img_primary = Vec::new();
        let mut img_secondary = Vec::new();
        for row_b in rows_b.iter() {
            let Some(row_a) = in_a.get(&row_b.point_id) else {
                continue;
            };
            let Some(obj_loc) = row_b.obj_loc() else {
                continue;
            };
            obj.push(obj_loc);
            img_primary.push(row_a.img_loc());
            img_secondary.push(row_b.img_loc());
        }
        if obj.len() < cfg.min_common_corners {
            continue;
        }
        let pose_primary = board_pose(cam_a, &obj, &img_primary)?;
        let pose_secondary = board_pose(cam_b, &obj, &img_secondary)?;
        let misfit_a = pose_misfit(cam_a, &pose_primary, &obj, &img_primary);
        let misfit_b = pose_misfit(cam_b, &pose_secondary, &obj, &img_secondary);
        if misfit_a > cfg.max_board_pose_error || misfit_b > cfg.max_board_pose_error {
            tracing::debug!(
                "excluding sync index {sync_index} for pair ({}, {}): \
                 board pose misfit {misfit_a:.1}/{misfit_b:.1} px",
                cam_a.port,
                cam_b.port
            );
            continue;
        }
        boards.push(SharedBoard {
            pose_primary,
            pose_secondary,
            obj,
            img_primary,
            img_secondary,
        });
    }
    Ok(boards)
}

/// Mean reprojection distance of a single-view board pose.
fn pose_misfit(
    cam: &CameraData,
    pose: &CameraExtrinsics,
    obj: &[Point3<f64>],
    img: &[Point2<f64>],
) -> f64 {
    let sum: f64 = obj
        .iter()
        .zip(img.iter())
        .map(|(o, i)| (project_pinhole_distorted(&cam.intrinsics, pose, o) - i).norm())
        .sum();
    sum / obj.len() as f64
}

/// Pose of the (planar, z = 0) board in one camera from its undistorted,
/// K-normalized corner observations.
fn board_pose(
    cam: &CameraData,
    obj: &[Point3<f64>],
    img: &[Point2<f64>],
) -> Result<CameraExtrinsics> {
    let k = cam.intrinsics.matrix();
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    let obj_xy: Vec<Point2<f64>> = obj.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let normalized: Vec<Point2<f64>> = img
        .iter()
        .map(|p| {
            let und = cam.intrinsics.undistort(p);
            Point2::new((und.x - cx) / fx, (und.y - cy) / fy)
        })
        .collect();
    Ok(planar_pose(&obj_xy, &normalized)?)
}

fn compose(pose_primary: &CameraExtrinsics, rel: &CameraExtrinsics) -> CameraExtrinsics {
    // board -> primary -> secondary, renormalized through the quaternion
    let rotation = rel.rotation() * pose_primary.rotation();
    let translation = rel.rotation() * pose_primary.translation() + rel.translation();
    let rvec = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation))
        .scaled_axis();
    CameraExtrinsics::from_rodrigues(rvec, translation)
}

/// RMSE of board reprojection over both views.
fn stereo_rmse(
    cam_a: &CameraData,
    cam_b: &CameraData,
    rel: &CameraExtrinsics,
    boards: &[SharedBoard],
) -> f64 {
    let mut sq = 0.0;
    let mut n = 0usize;
    for board in boards.iter() {
        let pose_b = compose(&board.pose_primary, rel);
        for ((obj, img_a), img_b) in board
            .obj
            .iter()
            .zip(board.img_primary.iter())
            .zip(board.img_secondary.iter())
        {
            let pred_a = project_pinhole_distorted(&cam_a.intrinsics, &board.pose_primary, obj);
            let pred_b = project_pinhole_distorted(&cam_b.intrinsics, &pose_b, obj);
            sq += (pred_a - img_a).norm_squared() + (pred_b - img_b).norm_squared();
            n += 2;
        }
    }
    (sq / n as f64).sqrt()
}

struct RelativePoseProblem<'a> {
    cam_b: CameraData,
    boards: &'a [SharedBoard],
    params_cache: DVector<f64>,
}

impl RelativePoseProblem<'_> {
    fn relative_pose(&self) -> CameraExtrinsics {
        let p = self.params_cache.as_slice();
        CameraExtrinsics::from_rodrigues(
            Vector3::new(p[0], p[1], p[2]),
            Vector3::new(p[3], p[4], p[5]),
        )
    }

    fn nresid(&self) -> usize {
        2 * self.boards.iter().map(|b| b.obj.len()).sum::<usize>()
    }

    fn residuals_for(&self, params: &DVector<f64>) -> DVector<f64> {
        let p = params.as_slice();
        let rel = CameraExtrinsics::from_rodrigues(
            Vector3::new(p[0], p[1], p[2]),
            Vector3::new(p[3], p[4], p[5]),
        );
        let mut out = DVector::zeros(self.nresid());
        let mut row = 0;
        for board in self.boards.iter() {
            let pose_b = compose(&board.pose_primary, &rel);
            for (obj, img_b) in board.obj.iter().zip(board.img_secondary.iter()) {
                let pred = project_pinhole_distorted(&self.cam_b.intrinsics, &pose_b, obj);
                out[row] = pred.x - img_b.x;
                out[row + 1] = pred.y - img_b.y;
                row += 2;
            }
        }
        out
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for RelativePoseProblem<'_> {
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
        Some(self.residuals_for(&self.params_cache))
    }

    fn jacobian(&self) -> Option<nalgebra::OMatrix<f64, Dyn, Dyn>> {
        let mut j = nalgebra::OMatrix::<f64, Dyn, Dyn>::zeros(self.nresid(), 6);
        for col in 0..6 {
            let step = 1e-6 * self.params_cache[col].abs().max(1.0);
            let mut p = self.params_cache.clone();
            p[col] += step;
            let plus = self.residuals_for(&p);
            p[col] -= 2.0 * step;
            let minus = self.residuals_for(&p);
            for row in 0..j.nrows() {
                j[(row, col)] = (plus[row] - minus[row]) / (2.0 * step);
            }
        }
        Some(j)
    }
}
