//! Joint refinement of camera extrinsics and 3-D point positions by
//! minimizing reprojection residuals.
//!
//! The problem instance is a [`PointDataBundle`]: a posed [`CameraArray`],
//! the 2-D observation table, and the current 3-D point estimates. The
//! parameter vector concatenates six extrinsic floats per camera (Rodrigues
//! rotation + translation, in the projection convention) and three floats
//! per point; intrinsics and distortions are held fixed. The Jacobian has
//! nonzeros only in the 2×6 camera block and 2×3 point block of each
//! observation, which the solver exploits through a finite-difference fill
//! over exactly those blocks.

use std::collections::BTreeMap;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{DVector, Dyn, Matrix3xX, Owned, Point2, Point3, Vector3};
use opencv_ros_camera::RosOpenCvIntrinsics;

use camrig_mvg::camera::project_world_point;
use camrig_mvg::extrinsics::CameraExtrinsics;
use camrig_mvg::{align_points, CameraArray, ReprojectionReport, ScaleAccuracy};
use camrig_types::{ImagePoints, Port, WorldPoint, WorldPoints};

pub const CAMERA_PARAM_COUNT: usize = 6;
pub const POINT_PARAM_COUNT: usize = 3;

#[derive(thiserror::Error, Debug)]
pub enum BundleAdjError {
    #[error(
        "bundle optimization did not converge: RMSE {last_rmse:.4} px after {iterations} iterations"
    )]
    BundleOptimizationDidNotConverge { last_rmse: f64, iterations: usize },
    #[error("rank deficient problem; unconstrained parameter indices {param_indices:?}")]
    RankDeficient { param_indices: Vec<usize> },
    #[error("insufficient observations: {what}")]
    InsufficientObservations { what: String },
    #[error(transparent)]
    Geom(#[from] camrig_mvg::GeomError),
    #[error(transparent)]
    Table(#[from] camrig_types::tables::TableError),
}

pub type Result<T> = std::result::Result<T, BundleAdjError>;

#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub ftol: f64,
    /// Maximum solver iterations before reporting non-convergence.
    pub max_iterations: usize,
    /// Fraction of worst observations dropped during iterative improvement.
    pub cull_fraction: f64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            ftol: 1e-4,
            max_iterations: 100,
            cull_fraction: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    cam: usize,
    point: usize,
    observed_x: f64,
    observed_y: f64,
}

/// The bundle-adjustment problem instance: cameras, 2-D observations, and
/// 3-D point estimates, with contiguous index maps for the solver.
///
/// A bundle is an immutable snapshot; [`PointDataBundle::optimize`] returns a
/// new bundle, leaving the input valid.
#[derive(Debug, Clone)]
pub struct PointDataBundle {
    camera_array: CameraArray,
    image_points: ImagePoints,
    world_points: WorldPoints,

    /// ports of posed, non-ignored cameras, in ascending order; the i-th
    /// entry owns parameter columns `6i..6i+6`
    cam_ports: Vec<Port>,
    /// world-point keys in table order; the j-th entry owns columns
    /// `6·n_cameras + 3j ..+3`
    point_keys: Vec<(u32, u32)>,
    observations: Vec<Observation>,
}

impl PointDataBundle {
    pub fn new(
        camera_array: CameraArray,
        image_points: ImagePoints,
        world_points: WorldPoints,
    ) -> Result<Self> {
        let cam_ports: Vec<Port> = camera_array.calibrated().map(|(port, _)| *port).collect();
        if cam_ports.is_empty() {
            return Err(BundleAdjError::InsufficientObservations {
                what: "no posed cameras in array".to_string(),
            });
        }
        let cam_index: BTreeMap<Port, usize> = cam_ports
            .iter()
            .enumerate()
            .map(|(i, port)| (*port, i))
            .collect();

        let point_keys: Vec<(u32, u32)> = world_points
            .rows()
            .iter()
            .map(|r| (r.sync_index, r.point_id))
            .collect();
        let point_index: BTreeMap<(u32, u32), usize> = point_keys
            .iter()
            .enumerate()
            .map(|(j, key)| (*key, j))
            .collect();

        let mut observations = Vec::new();
        for row in image_points.rows() {
            let Some(&cam) = cam_index.get(&row.port) else {
                continue;
            };
            let Some(&point) = point_index.get(&(row.sync_index, row.point_id)) else {
                continue;
            };
            observations.push(Observation {
                cam,
                point,
                observed_x: row.img_loc_x,
                observed_y: row.img_loc_y,
            });
        }
        if observations.is_empty() {
            return Err(BundleAdjError::InsufficientObservations {
                what: "no observation matches a posed camera and a world point".to_string(),
            });
        }

        Ok(Self {
            camera_array,
            image_points,
            world_points,
            cam_ports,
            point_keys,
            observations,
        })
    }

    #[inline]
    pub fn camera_array(&self) -> &CameraArray {
        &self.camera_array
    }

    #[inline]
    pub fn image_points(&self) -> &ImagePoints {
        &self.image_points
    }

    #[inline]
    pub fn world_points(&self) -> &WorldPoints {
        &self.world_points
    }

    pub fn n_cameras(&self) -> usize {
        self.cam_ports.len()
    }

    pub fn n_points(&self) -> usize {
        self.point_keys.len()
    }

    pub fn n_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn n_params(&self) -> usize {
        CAMERA_PARAM_COUNT * self.n_cameras() + POINT_PARAM_COUNT * self.n_points()
    }

    /// The current residual vector `[u'−u, v'−v, …]` of length
    /// `2·n_observations`.
    pub fn residuals(&self) -> Result<DVector<f64>> {
        let problem = self.make_problem()?;
        Ok(problem.residuals().expect("residuals are total"))
    }

    /// Reprojection RMSE over all observations, in pixels.
    pub fn rmse(&self) -> Result<f64> {
        let r = self.residuals()?;
        Ok(rmse_of_residuals(&r))
    }

    /// Structural nonzero coordinates of the Jacobian: for the i-th
    /// observation (rows `2i`, `2i+1`), the six columns of its camera and the
    /// three columns of its point. Exactly `18·n_observations` entries.
    pub fn jacobian_sparsity(&self) -> Vec<(usize, usize)> {
        let cam_cols = CAMERA_PARAM_COUNT * self.n_cameras();
        let mut entries = Vec::with_capacity(18 * self.observations.len());
        for (i, obs) in self.observations.iter().enumerate() {
            for row in [2 * i, 2 * i + 1] {
                for k in 0..CAMERA_PARAM_COUNT {
                    entries.push((row, obs.cam * CAMERA_PARAM_COUNT + k));
                }
                for k in 0..POINT_PARAM_COUNT {
                    entries.push((row, cam_cols + obs.point * POINT_PARAM_COUNT + k));
                }
            }
        }
        entries
    }

    /// Refine extrinsics and points, returning the optimized bundle.
    ///
    /// Both the camera parameters and the point coordinates are unpacked
    /// from the solver result and written back to the new bundle.
    pub fn optimize(&self, cfg: &BundleConfig) -> Result<PointDataBundle> {
        self.check_rank()?;
        let problem = self.make_problem()?;
        tracing::info!(
            "bundle adjustment: {} cameras, {} points, {} observations, {} parameters",
            self.n_cameras(),
            self.n_points(),
            self.n_observations(),
            self.n_params()
        );

        let (problem, report) = LevenbergMarquardt::new()
            .with_ftol(cfg.ftol)
            .with_patience(cfg.max_iterations)
            .minimize(problem);

        let residuals = problem.residuals().expect("residuals are total");
        let last_rmse = rmse_of_residuals(&residuals);
        if matches!(report.termination, TerminationReason::LostPatience) {
            return Err(BundleAdjError::BundleOptimizationDidNotConverge {
                last_rmse,
                iterations: report.number_of_evaluations,
            });
        }
        if !report.termination.was_successful() {
            tracing::warn!("solver terminated with {:?}", report.termination);
        }
        tracing::info!("bundle adjustment finished: RMSE {last_rmse:.4} px");

        self.with_params(&problem.params())
    }

    /// Optimize, drop the worst `cull_fraction` of observations, re-optimize,
    /// then restore the full observation set for a final pass.
    pub fn optimize_with_culling(&self, cfg: &BundleConfig) -> Result<PointDataBundle> {
        let first = self.optimize(cfg)?;

        let residuals = first.residuals()?;
        let keep = keep_mask(&residuals, cfg.cull_fraction);
        let kept_rows: Vec<camrig_types::ImagePoint> = first
            .image_rows_in_observation_order()
            .zip(keep.iter())
            .filter(|(_, keep)| **keep)
            .map(|(row, _)| row.clone())
            .collect();
        tracing::info!(
            "culling: re-optimizing with {} of {} observations",
            kept_rows.len(),
            keep.len()
        );

        let subset = PointDataBundle::new(
            first.camera_array.clone(),
            ImagePoints::new(kept_rows)?,
            first.world_points.clone(),
        )?;
        let refined = subset.optimize(cfg)?;

        // restore the full observation set and optimize once more
        let full = PointDataBundle::new(
            refined.camera_array.clone(),
            self.image_points.clone(),
            refined.world_points.clone(),
        )?;
        full.optimize(cfg)
    }

    /// Gauge fix: find the similarity transform mapping the triangulated
    /// points at `sync_index` onto their known object coordinates and apply
    /// it to every camera and every 3-D point. Idempotent up to float
    /// tolerance.
    pub fn align_to_object(&self, sync_index: u32) -> Result<PointDataBundle> {
        let mut moving = Vec::new();
        let mut fixed = Vec::new();
        for world in self.world_points.at_sync_index(sync_index) {
            let obj = self.image_points.rows().iter().find_map(|r| {
                if r.sync_index == sync_index && r.point_id == world.point_id {
                    r.obj_loc()
                } else {
                    None
                }
            });
            if let Some(obj) = obj {
                moving.push(world.coords());
                fixed.push(obj);
            }
        }
        if moving.len() < 3 {
            return Err(BundleAdjError::InsufficientObservations {
                what: format!(
                    "{} object-referenced points at sync index {sync_index}, need at least 3",
                    moving.len()
                ),
            });
        }

        let xform = align_points(&moving, &fixed)?;
        tracing::info!(
            "gauge alignment at sync index {sync_index}: scale {:.6}",
            xform.scale
        );

        let camera_array = self.camera_array.transformed(&xform)?;
        let world_points = WorldPoints::new(
            self.world_points
                .rows()
                .iter()
                .map(|r| {
                    let p = xform.apply(&r.coords());
                    WorldPoint {
                        x_coord: p.x,
                        y_coord: p.y,
                        z_coord: p.z,
                        ..r.clone()
                    }
                })
                .collect(),
        )?;

        PointDataBundle::new(camera_array, self.image_points.clone(), world_points)
    }

    pub fn reprojection_report(&self) -> Result<ReprojectionReport> {
        Ok(ReprojectionReport::compute(
            &self.camera_array,
            &self.image_points,
            &self.world_points,
        )?)
    }

    /// Scale accuracy at a reference frame with known object geometry.
    pub fn scale_accuracy(&self, sync_index: u32) -> Result<ScaleAccuracy> {
        let mut world = Vec::new();
        let mut object = Vec::new();
        for row in self.world_points.at_sync_index(sync_index) {
            let obj = self.image_points.rows().iter().find_map(|r| {
                if r.sync_index == sync_index && r.point_id == row.point_id {
                    r.obj_loc()
                } else {
                    None
                }
            });
            if let Some(obj) = obj {
                world.push(row.coords());
                object.push(obj);
            }
        }
        Ok(ScaleAccuracy::compute(&world, &object, sync_index)?)
    }

    /// Fail when a camera owns parameters no residual references.
    fn check_rank(&self) -> Result<()> {
        let mut seen = vec![false; self.n_cameras()];
        for obs in self.observations.iter() {
            seen[obs.cam] = true;
        }
        let mut param_indices = Vec::new();
        for (i, seen) in seen.iter().enumerate() {
            if !seen {
                param_indices.extend(i * CAMERA_PARAM_COUNT..(i + 1) * CAMERA_PARAM_COUNT);
            }
        }
        if param_indices.is_empty() {
            Ok(())
        } else {
            Err(BundleAdjError::RankDeficient { param_indices })
        }
    }

    fn make_problem(&self) -> Result<ReprojectionProblem> {
        let mut intrinsics = Vec::with_capacity(self.n_cameras());
        let mut params = Vec::with_capacity(self.n_params());
        for port in self.cam_ports.iter() {
            let cam = self.camera_array.require(*port)?;
            let e = cam.extrinsics()?;
            let r = e.rodrigues();
            let t = e.translation();
            params.extend([r.x, r.y, r.z, t.x, t.y, t.z]);
            intrinsics.push(cam.intrinsics.inner().clone());
        }
        for key in self.point_keys.iter() {
            let row = self
                .world_points
                .get(key.0, key.1)
                .expect("point keys come from the table");
            params.extend([row.x_coord, row.y_coord, row.z_coord]);
        }

        let mut problem = ReprojectionProblem {
            intrinsics,
            observations: self.observations.clone(),
            n_cameras: self.n_cameras(),
            n_points: self.n_points(),
            cams: Vec::new(),
            points: Matrix3xX::zeros(self.n_points()),
            params_cache: DVector::zeros(0),
        };
        problem.set_params(&DVector::from_vec(params));
        Ok(problem)
    }

    /// Build the bundle that corresponds to a solver parameter vector:
    /// cameras AND points are written back.
    fn with_params(&self, params: &DVector<f64>) -> Result<PointDataBundle> {
        debug_assert_eq!(params.len(), self.n_params());
        let p = params.as_slice();

        let mut camera_array = self.camera_array.clone();
        for (i, port) in self.cam_ports.iter().enumerate() {
            let base = i * CAMERA_PARAM_COUNT;
            let extr = CameraExtrinsics::from_rodrigues(
                Vector3::new(p[base], p[base + 1], p[base + 2]),
                Vector3::new(p[base + 3], p[base + 4], p[base + 5]),
            );
            camera_array
                .get_mut(*port)
                .expect("port came from the array")
                .extrinsics = Some(extr);
        }

        let point_base = CAMERA_PARAM_COUNT * self.n_cameras();
        let world_points = WorldPoints::new(
            self.point_keys
                .iter()
                .enumerate()
                .map(|(j, key)| {
                    let orig = self
                        .world_points
                        .get(key.0, key.1)
                        .expect("point keys come from the table");
                    let base = point_base + j * POINT_PARAM_COUNT;
                    WorldPoint {
                        x_coord: p[base],
                        y_coord: p[base + 1],
                        z_coord: p[base + 2],
                        ..orig.clone()
                    }
                })
                .collect(),
        )?;

        PointDataBundle::new(camera_array, self.image_points.clone(), world_points)
    }

    /// Image rows in the same order as `self.observations`.
    fn image_rows_in_observation_order(&self) -> impl Iterator<Item = &camrig_types::ImagePoint> {
        // observations were built by filtering image rows in order, so a
        // second filtered pass yields the matching sequence
        let cam_ports = &self.cam_ports;
        let keys: std::collections::BTreeSet<(u32, u32)> =
            self.point_keys.iter().copied().collect();
        self.image_points.rows().iter().filter(move |row| {
            cam_ports.contains(&row.port) && keys.contains(&(row.sync_index, row.point_id))
        })
    }
}

fn rmse_of_residuals(residuals: &DVector<f64>) -> f64 {
    let n_obs = residuals.len() / 2;
    let mut sq = 0.0;
    for i in 0..n_obs {
        sq += residuals[2 * i] * residuals[2 * i] + residuals[2 * i + 1] * residuals[2 * i + 1];
    }
    (sq / n_obs as f64).sqrt()
}

/// Mask of observations to keep: everything below the `cull_fraction`
/// percentile of per-observation reprojection distance.
fn keep_mask(residuals: &DVector<f64>, cull_fraction: f64) -> Vec<bool> {
    let n_obs = residuals.len() / 2;
    let dist: Vec<f64> = (0..n_obs)
        .map(|i| {
            (residuals[2 * i] * residuals[2 * i] + residuals[2 * i + 1] * residuals[2 * i + 1])
                .sqrt()
        })
        .collect();
    let mut order: Vec<usize> = (0..n_obs).collect();
    order.sort_by(|a, b| dist[*a].partial_cmp(&dist[*b]).unwrap());
    let n_keep = ((1.0 - cull_fraction) * n_obs as f64).ceil() as usize;
    let mut keep = vec![false; n_obs];
    for &idx in order.iter().take(n_keep) {
        keep[idx] = true;
    }
    keep
}

/// Verify the writeback invariant: after optimization every camera's
/// parameters must actually have moved. Panics otherwise; for test harnesses.
pub fn assert_cameras_moved(before: &CameraArray, after: &CameraArray, min_delta: f64) {
    for (port, cam_before) in before.calibrated() {
        let e_before = cam_before.extrinsics().expect("calibrated camera");
        let cam_after = after
            .get(*port)
            .unwrap_or_else(|| panic!("camera {port} missing after optimization"));
        let e_after = cam_after.extrinsics().expect("calibrated camera");

        let r_b = e_before.rodrigues();
        let r_a = e_after.rodrigues();
        let delta = (r_a - r_b).norm() + (e_after.translation() - e_before.translation()).norm();
        assert!(
            delta > min_delta,
            "camera {port} did not move during optimization (Δ = {delta:.3e}); \
             was the solver result written back?"
        );
    }
}

/// The `LeastSquaresProblem` driven by the solver. Rebuilt camera models and
/// the point matrix are cached on every `set_params` call.
#[derive(Clone)]
struct ReprojectionProblem {
    intrinsics: Vec<RosOpenCvIntrinsics<f64>>,
    observations: Vec<Observation>,
    n_cameras: usize,
    n_points: usize,

    cams: Vec<cam_geom::Camera<f64, RosOpenCvIntrinsics<f64>>>,
    points: Matrix3xX<f64>,
    params_cache: DVector<f64>,
}

impl ReprojectionProblem {
    fn camera_from_slice(&self, cam_idx: usize, p: &[f64]) -> cam_geom::Camera<f64, RosOpenCvIntrinsics<f64>> {
        let extr = CameraExtrinsics::from_rodrigues(
            Vector3::new(p[0], p[1], p[2]),
            Vector3::new(p[3], p[4], p[5]),
        );
        cam_geom::Camera::new(self.intrinsics[cam_idx].clone(), extr.to_cam_geom())
    }

    fn predict(
        &self,
        cam: &cam_geom::Camera<f64, RosOpenCvIntrinsics<f64>>,
        point: &Point3<f64>,
    ) -> Point2<f64> {
        project_world_point(cam, point)
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for ReprojectionProblem {
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params_cache = x.clone();
        let p = x.as_slice();

        let mut cams = Vec::with_capacity(self.n_cameras);
        for i in 0..self.n_cameras {
            let base = i * CAMERA_PARAM_COUNT;
            cams.push(self.camera_from_slice(i, &p[base..base + CAMERA_PARAM_COUNT]));
        }
        self.cams = cams;

        let point_base = CAMERA_PARAM_COUNT * self.n_cameras;
        self.points = Matrix3xX::from_column_slice(&p[point_base..]);
    }

    fn params(&self) -> DVector<f64> {
        self.params_cache.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(2 * self.observations.len());
        for (i, obs) in self.observations.iter().enumerate() {
            let pt = self.points.column(obs.point);
            let predicted = self.predict(
                &self.cams[obs.cam],
                &Point3::new(pt.x, pt.y, pt.z),
            );
            residuals[2 * i] = predicted.x - obs.observed_x;
            residuals[2 * i + 1] = predicted.y - obs.observed_y;
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<nalgebra::OMatrix<f64, Dyn, Dyn>> {
        let nresid = 2 * self.observations.len();
        let nparams = self.params_cache.len();
        let mut j = nalgebra::OMatrix::<f64, Dyn, Dyn>::zeros(nresid, nparams);

        // observation indices grouped by camera and by point, so that each
        // finite-difference evaluation touches only the residuals its
        // parameter can influence
        let mut obs_by_cam: Vec<Vec<usize>> = vec![Vec::new(); self.n_cameras];
        let mut obs_by_point: Vec<Vec<usize>> = vec![Vec::new(); self.n_points];
        for (i, obs) in self.observations.iter().enumerate() {
            obs_by_cam[obs.cam].push(i);
            obs_by_point[obs.point].push(i);
        }

        let p = self.params_cache.as_slice();

        // camera blocks: 2x6 per observation
        for c in 0..self.n_cameras {
            let base = c * CAMERA_PARAM_COUNT;
            for k in 0..CAMERA_PARAM_COUNT {
                let col = base + k;
                let step = 1e-6 * p[col].abs().max(1.0);

                let mut local = [0.0; CAMERA_PARAM_COUNT];
                local.copy_from_slice(&p[base..base + CAMERA_PARAM_COUNT]);
                local[k] += step;
                let cam_plus = self.camera_from_slice(c, &local);
                local[k] -= 2.0 * step;
                let cam_minus = self.camera_from_slice(c, &local);

                for &i in obs_by_cam[c].iter() {
                    let obs = &self.observations[i];
                    let pt = self.points.column(obs.point);
                    let pt = Point3::new(pt.x, pt.y, pt.z);
                    let plus = self.predict(&cam_plus, &pt);
                    let minus = self.predict(&cam_minus, &pt);
                    j[(2 * i, col)] = (plus.x - minus.x) / (2.0 * step);
                    j[(2 * i + 1, col)] = (plus.y - minus.y) / (2.0 * step);
                }
            }
        }

        // point blocks: 2x3 per observation
        let point_base = CAMERA_PARAM_COUNT * self.n_cameras;
        for q in 0..self.n_points {
            let col0 = point_base + q * POINT_PARAM_COUNT;
            let pt = self.points.column(q);
            for k in 0..POINT_PARAM_COUNT {
                let col = col0 + k;
                let step = 1e-6 * p[col].abs().max(1.0);
                let mut plus_pt = Point3::new(pt.x, pt.y, pt.z);
                let mut minus_pt = plus_pt;
                plus_pt[k] += step;
                minus_pt[k] -= step;

                for &i in obs_by_point[q].iter() {
                    let obs = &self.observations[i];
                    let cam = &self.cams[obs.cam];
                    let plus = self.predict(cam, &plus_pt);
                    let minus = self.predict(cam, &minus_pt);
                    j[(2 * i, col)] = (plus.x - minus.x) / (2.0 * step);
                    j[(2 * i + 1, col)] = (plus.y - minus.y) / (2.0 * step);
                }
            }
        }

        Some(j)
    }
}

#[cfg(test)]
mod tests;
