//! 3-D point recovery by the Direct Linear Transform.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, OMatrix, Point2, Point3, Vector4, U3, U4};

use camrig_types::{ImagePoints, WorldPoint, WorldPoints};

use crate::camera::CameraData;
use crate::camera_array::CameraArray;
use crate::{GeomError, Result};

/// The linear projection matrix `P = K·[R|t]` of a posed camera.
pub fn projection_matrix(cam: &CameraData) -> Result<OMatrix<f64, U3, U4>> {
    let e = cam.extrinsics()?;
    Ok(cam.intrinsics.matrix() * e.matrix3x4())
}

/// Triangulate one point from ≥2 undistorted pixel observations.
///
/// For each observing camera, two rows `[u·P₂−P₀; v·P₂−P₁]` are stacked into
/// `A`; the solution is the right-singular vector of `A` with the smallest
/// singular value, dehomogenized.
pub fn triangulate_point(
    observations: &[(OMatrix<f64, U3, U4>, Point2<f64>)],
) -> Result<Point3<f64>> {
    if observations.len() < 2 {
        return Err(GeomError::InsufficientObservations {
            what: format!(
                "{} observations, triangulation needs at least 2",
                observations.len()
            ),
        });
    }

    let mut a = DMatrix::<f64>::zeros(2 * observations.len(), 4);
    for (i, (p, pixel)) in observations.iter().enumerate() {
        let row0 = p.row(2) * pixel.x - p.row(0);
        let row1 = p.row(2) * pixel.y - p.row(1);
        for c in 0..4 {
            a[(2 * i, c)] = row0[c];
            a[(2 * i + 1, c)] = row1[c];
        }
    }

    let h = crate::homography::smallest_right_singular_vector(a)?;
    let h = Vector4::new(h[0], h[1], h[2], h[3]);
    if h.w.abs() < 1e-12 {
        return Err(GeomError::SvdFailed);
    }
    Ok(Point3::new(h.x / h.w, h.y / h.w, h.z / h.w))
}

/// Triangulate every `(sync_index, point_id)` with at least two observations
/// into a [`WorldPoints`] table. Observations are undistorted before the DLT;
/// points seen by a single camera are omitted.
pub fn triangulate_table(array: &CameraArray, image_points: &ImagePoints) -> Result<WorldPoints> {
    // projection matrices once per camera
    let mut pmats = BTreeMap::new();
    for (port, cam) in array.calibrated() {
        pmats.insert(*port, (projection_matrix(cam)?, cam));
    }

    // (sync_index, point_id) -> observations
    let mut groups: BTreeMap<(u32, u32), Vec<(&CameraData, &camrig_types::ImagePoint)>> =
        BTreeMap::new();
    for row in image_points.rows() {
        let Some((_, cam)) = pmats.get(&row.port) else {
            continue;
        };
        groups
            .entry((row.sync_index, row.point_id))
            .or_default()
            .push((*cam, row));
    }

    let mut rows = Vec::new();
    let mut skipped_single = 0usize;
    for ((sync_index, point_id), obs) in groups {
        if obs.len() < 2 {
            skipped_single += 1;
            continue;
        }
        let mut dlt_inputs = Vec::with_capacity(obs.len());
        let mut frame_time_sum = 0.0;
        for (cam, row) in obs.iter() {
            let undistorted = cam.intrinsics.undistort(&row.img_loc());
            let (pmat, _) = &pmats[&row.port];
            dlt_inputs.push((*pmat, undistorted));
            frame_time_sum += row.frame_time;
        }
        match triangulate_point(&dlt_inputs) {
            Ok(p) => rows.push(WorldPoint {
                sync_index,
                point_id,
                frame_time: frame_time_sum / obs.len() as f64,
                x_coord: p.x,
                y_coord: p.y,
                z_coord: p.z,
            }),
            Err(err) => {
                tracing::warn!(
                    "dropping point {point_id} at sync index {sync_index}: {err}"
                );
            }
        }
    }
    if skipped_single > 0 {
        tracing::debug!("{skipped_single} single-view points not triangulated");
    }

    WorldPoints::new(rows).map_err(|e| GeomError::ShapeOrInvariantViolation {
        what: format!("triangulation produced duplicate keys: {e}"),
    })
}
