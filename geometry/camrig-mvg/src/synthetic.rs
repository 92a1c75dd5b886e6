//! Synthetic scenes for exercising the calibration pipeline.
//!
//! A ring of pinhole cameras looks at the origin while a rigid planar grid
//! moves along a helix with a slow tumble. Projections are exact, so test
//! expectations can be tight; callers add noise where a scenario requires it.

use nalgebra::{Isometry3, Matrix3, Point2, Point3, Rotation3, Translation3, UnitQuaternion, Unit, Vector3};

use camrig_types::{ImagePoint, ImagePoints, Port, WorldPoint, WorldPoints};

use crate::camera::{CameraData, CameraIntrinsics};
use crate::camera_array::CameraArray;
use crate::extrinsics::CameraExtrinsics;

pub const SYNTH_FPS: f64 = 30.0;

/// `n` identical cameras evenly spaced on a circle of `radius_mm` at
/// `height_mm`, all looking at the world origin. Zero distortion.
pub fn camera_ring(
    n: usize,
    focal_px: f64,
    width: usize,
    height: usize,
    radius_mm: f64,
    height_mm: f64,
) -> CameraArray {
    let matrix = Matrix3::new(
        focal_px,
        0.0,
        width as f64 / 2.0,
        0.0,
        focal_px,
        height as f64 / 2.0,
        0.0,
        0.0,
        1.0,
    );

    let mut array = CameraArray::default();
    for i in 0..n {
        let theta = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
        let center = Vector3::new(radius_mm * theta.cos(), radius_mm * theta.sin(), height_mm);
        let lookat = Vector3::zeros();
        let up = Unit::new_normalize(Vector3::z());

        let pose = cam_geom::ExtrinsicParameters::from_view(&center, &lookat, &up);
        let iso = pose.pose();
        let extrinsics = CameraExtrinsics::new(
            iso.rotation.to_rotation_matrix().into_inner(),
            iso.translation.vector,
        )
        .expect("from_view yields a proper rotation");

        let intrinsics =
            CameraIntrinsics::from_matrix_and_distortions(width, height, &matrix, &[0.0; 5]);
        let mut cam = CameraData::new(Port(i as u8), intrinsics);
        cam.extrinsics = Some(extrinsics);
        array.insert(cam);
    }
    array
}

/// A rigid planar grid of `cols × rows` corners with the given spacing,
/// in its local (object) frame: ids row-major, z = 0, centered on the origin.
pub fn board_grid(cols: u32, rows: u32, spacing_mm: f64) -> Vec<(u32, Point3<f64>)> {
    let x0 = -spacing_mm * f64::from(cols - 1) / 2.0;
    let y0 = -spacing_mm * f64::from(rows - 1) / 2.0;
    let mut points = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let id = row * cols + col;
            points.push((
                id,
                Point3::new(
                    x0 + spacing_mm * f64::from(col),
                    y0 + spacing_mm * f64::from(row),
                    0.0,
                ),
            ));
        }
    }
    points
}

/// Board poses along a helix with a slow tumble, one per frame.
pub fn helix_poses(n_frames: usize) -> Vec<Isometry3<f64>> {
    (0..n_frames)
        .map(|k| {
            let kf = k as f64;
            let theta = 0.25 * kf;
            let translation = Translation3::new(
                180.0 * theta.cos(),
                180.0 * theta.sin(),
                -100.0 + 12.0 * kf,
            );
            let tumble = UnitQuaternion::from_scaled_axis(
                Vector3::new(0.4, 0.7, 0.2).normalize() * (0.06 * kf),
            );
            Isometry3::from_parts(translation, tumble)
        })
        .collect()
}

/// Project the moving board into every camera, producing the long-form
/// observation table with object locations populated. Points behind a camera
/// or outside its image bounds are not observed by it.
pub fn project_scene(
    array: &CameraArray,
    board: &[(u32, Point3<f64>)],
    poses: &[Isometry3<f64>],
) -> ImagePoints {
    let mut rows = Vec::new();
    for (k, pose) in poses.iter().enumerate() {
        let sync_index = k as u32;
        let frame_time = k as f64 / SYNTH_FPS;
        for (point_id, local) in board.iter() {
            let world = pose * local;
            for (port, cam) in array.iter() {
                let Some(extrinsics) = &cam.extrinsics else {
                    continue;
                };
                let in_cam = extrinsics.transform_point(&world);
                if in_cam.z <= 0.0 {
                    continue;
                }
                let px = cam.project(&world).expect("posed camera");
                if px.x < 0.0
                    || px.y < 0.0
                    || px.x >= cam.intrinsics.width() as f64
                    || px.y >= cam.intrinsics.height() as f64
                {
                    continue;
                }
                rows.push(ImagePoint {
                    sync_index,
                    port: *port,
                    frame_index: sync_index,
                    frame_time,
                    point_id: *point_id,
                    img_loc_x: px.x,
                    img_loc_y: px.y,
                    obj_loc_x: Some(local.x),
                    obj_loc_y: Some(local.y),
                    obj_loc_z: Some(local.z),
                });
            }
        }
    }
    ImagePoints::new(rows).expect("synthetic keys are unique")
}

/// Ground-truth world positions of every board corner at every frame.
pub fn true_world_points(
    board: &[(u32, Point3<f64>)],
    poses: &[Isometry3<f64>],
) -> WorldPoints {
    let mut rows = Vec::new();
    for (k, pose) in poses.iter().enumerate() {
        for (point_id, local) in board.iter() {
            let world = pose * local;
            rows.push(WorldPoint {
                sync_index: k as u32,
                point_id: *point_id,
                frame_time: k as f64 / SYNTH_FPS,
                x_coord: world.x,
                y_coord: world.y,
                z_coord: world.z,
            });
        }
    }
    WorldPoints::new(rows).expect("synthetic keys are unique")
}

/// Project a single world point into one camera, returning `None` when it is
/// behind the camera or out of frame.
pub fn observe(cam: &CameraData, world: &Point3<f64>) -> Option<Point2<f64>> {
    let extrinsics = cam.extrinsics.as_ref()?;
    let in_cam = extrinsics.transform_point(world);
    if in_cam.z <= 0.0 {
        return None;
    }
    let px = cam.project(world).ok()?;
    if px.x < 0.0
        || px.y < 0.0
        || px.x >= cam.intrinsics.width() as f64
        || px.y >= cam.intrinsics.height() as f64
    {
        return None;
    }
    Some(px)
}

/// Repose every camera in the array by perturbing rotation and translation,
/// used to test that optimization recovers the truth.
pub fn perturb_extrinsics(
    array: &CameraArray,
    rotation_offsets: &[Vector3<f64>],
    translation_offsets: &[Vector3<f64>],
) -> CameraArray {
    let mut out = array.clone();
    for (i, (port, _)) in array.iter().enumerate() {
        let cam = out.get_mut(*port).unwrap();
        let e = cam.extrinsics.as_ref().unwrap();
        let rot = Rotation3::new(rotation_offsets[i % rotation_offsets.len()]).into_inner()
            * e.rotation();
        let t = e.translation() + translation_offsets[i % translation_offsets.len()];
        cam.extrinsics = Some(CameraExtrinsics::new(rot, t).expect("perturbed rotation"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_cameras_look_at_origin() {
        let array = camera_ring(4, 800.0, 1920, 1080, 2000.0, 500.0);
        assert_eq!(array.len(), 4);
        for (_, cam) in array.iter() {
            let px = observe(cam, &Point3::origin()).expect("origin visible");
            approx::assert_relative_eq!(px.x, 960.0, epsilon = 1e-6);
            approx::assert_relative_eq!(px.y, 540.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn scene_projection_covers_all_frames() {
        let array = camera_ring(4, 800.0, 1920, 1080, 2000.0, 500.0);
        let board = board_grid(5, 7, 50.0);
        let poses = helix_poses(20);
        let table = project_scene(&array, &board, &poses);
        assert_eq!(table.sync_indices().len(), 20);
        // the board stays well inside a 2 m ring's shared view
        assert_eq!(table.len(), 20 * 35 * 4);
    }
}
