//! Reprojection-error accounting and scale-accuracy reporting.

use std::collections::BTreeMap;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use camrig_types::{ImagePoints, Port, WorldPoints};

use crate::camera::project_world_point;
use crate::camera_array::CameraArray;
use crate::{GeomError, Result};

/// Residual statistics for a single tracked point across all observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResiduals {
    pub count: usize,
    pub mean: f64,
    pub max: f64,
}

/// Reprojection quality of a calibrated bundle, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionReport {
    /// `sqrt(mean(residual²))` over every observation, in pixels.
    pub overall_rmse: f64,
    pub per_camera_rmse: BTreeMap<Port, f64>,
    pub per_point: BTreeMap<u32, PointResiduals>,
    pub n_observations: usize,
}

impl ReprojectionReport {
    /// Project every world point into every camera that observed it and
    /// aggregate the pixel residuals.
    pub fn compute(
        array: &CameraArray,
        image_points: &ImagePoints,
        world_points: &WorldPoints,
    ) -> Result<Self> {
        let mut cams = BTreeMap::new();
        for (port, cam) in array.calibrated() {
            cams.insert(*port, cam.projection_camera()?);
        }

        let mut sq_sum = 0.0;
        let mut n = 0usize;
        let mut per_camera: BTreeMap<Port, (f64, usize)> = BTreeMap::new();
        let mut per_point: BTreeMap<u32, Vec<f64>> = BTreeMap::new();

        for row in image_points.rows() {
            let Some(cam) = cams.get(&row.port) else {
                continue;
            };
            let Some(world) = world_points.get(row.sync_index, row.point_id) else {
                continue;
            };
            let predicted = project_world_point(cam, &world.coords());
            let residual = (predicted - row.img_loc()).norm();
            if !residual.is_finite() {
                tracing::warn!(
                    "dropping non-finite residual for point {} at sync index {} port {}",
                    row.point_id,
                    row.sync_index,
                    row.port
                );
                continue;
            }

            sq_sum += residual * residual;
            n += 1;
            let e = per_camera.entry(row.port).or_insert((0.0, 0));
            e.0 += residual * residual;
            e.1 += 1;
            per_point.entry(row.point_id).or_default().push(residual);
        }

        if n == 0 {
            return Err(GeomError::InsufficientObservations {
                what: "no observation matched a triangulated point".to_string(),
            });
        }

        let per_camera_rmse = per_camera
            .into_iter()
            .map(|(port, (sq, count))| (port, (sq / count as f64).sqrt()))
            .collect();
        let per_point = per_point
            .into_iter()
            .map(|(id, residuals)| {
                let count = residuals.len();
                let mean = residuals.iter().sum::<f64>() / count as f64;
                let max = residuals.iter().fold(0.0f64, |acc, r| acc.max(*r));
                (id, PointResiduals { count, mean, max })
            })
            .collect();

        Ok(Self {
            overall_rmse: (sq_sum / n as f64).sqrt(),
            per_camera_rmse,
            per_point,
            n_observations: n,
        })
    }
}

/// How well triangulated inter-point distances match the known target
/// geometry at a reference frame. All pairwise distances are compared, which
/// catches scale drift that reprojection residuals cannot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleAccuracy {
    pub reference_sync_index: u32,
    pub n_corners: usize,
    pub n_distance_pairs: usize,
    pub distance_rmse_mm: f64,
    pub mean_abs_error_mm: f64,
    pub max_abs_error_mm: f64,
    /// Distance RMSE as a percentage of the mean true distance.
    pub relative_error_percent: f64,
}

impl ScaleAccuracy {
    pub fn compute(
        world: &[Point3<f64>],
        object: &[Point3<f64>],
        reference_sync_index: u32,
    ) -> Result<Self> {
        if world.len() != object.len() {
            return Err(GeomError::ShapeOrInvariantViolation {
                what: format!(
                    "point count mismatch: {} world vs {} object",
                    world.len(),
                    object.len()
                ),
            });
        }
        if world.len() < 2 {
            return Err(GeomError::InsufficientObservations {
                what: format!("{} points, distance check needs at least 2", world.len()),
            });
        }

        let mut sq_sum = 0.0;
        let mut abs_sum = 0.0;
        let mut max_abs = 0.0f64;
        let mut true_sum = 0.0;
        let mut n_pairs = 0usize;
        for i in 0..world.len() {
            for j in (i + 1)..world.len() {
                let measured = (world[i] - world[j]).norm();
                let truth = (object[i] - object[j]).norm();
                let err = measured - truth;
                sq_sum += err * err;
                abs_sum += err.abs();
                max_abs = max_abs.max(err.abs());
                true_sum += truth;
                n_pairs += 1;
            }
        }

        let distance_rmse_mm = (sq_sum / n_pairs as f64).sqrt();
        let mean_true = true_sum / n_pairs as f64;
        let relative_error_percent = if mean_true > 0.0 {
            100.0 * distance_rmse_mm / mean_true
        } else {
            0.0
        };

        Ok(Self {
            reference_sync_index,
            n_corners: world.len(),
            n_distance_pairs: n_pairs,
            distance_rmse_mm,
            mean_abs_error_mm: abs_sum / n_pairs as f64,
            max_abs_error_mm: max_abs,
            relative_error_percent,
        })
    }
}
