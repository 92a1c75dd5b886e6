//! End-to-end pipeline scenarios on synthetic scenes: a 4-camera ring
//! watching a rigid grid tumbling along a helix.

use std::collections::BTreeMap;

use approx::assert_relative_eq;
use nalgebra::{Isometry3, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use bundle_adj::{BundleConfig, PointDataBundle};
use camrig::session::subsample_sync_indices;
use camrig_mvg::synthetic;
use camrig_mvg::{triangulate_table, CameraArray};
use camrig_types::{ImagePoint, ImagePoints, Port};
use pose_graph::{
    initialize_array, stereo_calibrate_pairs, BootstrapConfig, InitializerConfig, StereoPair,
};

const N_FRAMES: usize = 20;
const BA_NTH: u32 = 5;

struct Scene {
    array: CameraArray,
    table: ImagePoints,
    poses: Vec<Isometry3<f64>>,
}

fn ring_scene() -> Scene {
    let array = synthetic::camera_ring(4, 800.0, 1920, 1080, 2000.0, 500.0);
    let board = synthetic::board_grid(5, 7, 50.0);
    let poses = synthetic::helix_poses(N_FRAMES);
    let table = synthetic::project_scene(&array, &board, &poses);
    Scene {
        array,
        table,
        poses,
    }
}

fn without_extrinsics(array: &CameraArray) -> CameraArray {
    let mut out = array.clone();
    for port in out.ports() {
        out.get_mut(port).unwrap().extrinsics = None;
    }
    out
}

fn add_pixel_noise(table: &ImagePoints, sigma: f64, seed: u64) -> ImagePoints {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    let rows: Vec<ImagePoint> = table
        .rows()
        .iter()
        .map(|r| ImagePoint {
            img_loc_x: r.img_loc_x + normal.sample(&mut rng),
            img_loc_y: r.img_loc_y + normal.sample(&mut rng),
            ..r.clone()
        })
        .collect();
    ImagePoints::new(rows).unwrap()
}

/// True extrinsics of every camera expressed in the board frame at frame 0,
/// the frame `align_to_object(0)` maps the solution into.
fn truth_in_board_frame(scene: &Scene) -> BTreeMap<Port, (Matrix3<f64>, Vector3<f64>)> {
    let pose0 = &scene.poses[0];
    let r0 = pose0.rotation.to_rotation_matrix().into_inner();
    let t0 = pose0.translation.vector;

    scene
        .array
        .iter()
        .map(|(port, cam)| {
            let e = cam.extrinsics().unwrap();
            let r = e.rotation() * r0;
            let t = e.rotation() * t0 + e.translation();
            (*port, (r, t))
        })
        .collect()
}

fn rotation_error_degrees(a: &Matrix3<f64>, b: &Matrix3<f64>) -> f64 {
    let relative = a * b.transpose();
    let cos = ((relative.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

fn run_pipeline(
    intrinsics_only: &CameraArray,
    table: &ImagePoints,
    bundle_cfg: &BundleConfig,
) -> (PointDataBundle, Vec<StereoPair>) {
    let pairs = stereo_calibrate_pairs(intrinsics_only, table, &BootstrapConfig::default());
    assert!(!pairs.is_empty(), "no stereo pairs qualified");

    let initialized =
        initialize_array(intrinsics_only, &pairs, &InitializerConfig::default()).unwrap();

    let ba_table = subsample_sync_indices(table, BA_NTH);
    let seed = triangulate_table(&initialized, &ba_table).unwrap();
    let bundle = PointDataBundle::new(initialized, ba_table, seed).unwrap();
    let optimized = bundle.optimize(bundle_cfg).unwrap();
    let aligned = optimized.align_to_object(0).unwrap();
    (aligned, pairs)
}

#[test]
fn charuco_bootstrap_round_trip_is_exact() {
    // zero distortion, zero noise: the whole pipeline should reproduce the
    // geometry to numerical precision
    let scene = ring_scene();
    let cfg = BundleConfig {
        ftol: 1e-14,
        max_iterations: 200,
        ..Default::default()
    };
    let (aligned, _) = run_pipeline(&without_extrinsics(&scene.array), &scene.table, &cfg);

    let report = aligned.reprojection_report().unwrap();
    assert!(
        report.overall_rmse < 1e-6,
        "overall RMSE {} px",
        report.overall_rmse
    );

    let truth = truth_in_board_frame(&scene);
    for (port, cam) in aligned.camera_array().iter() {
        let e = cam.extrinsics().unwrap();
        let (r_true, t_true) = &truth[port];
        let rot_err = rotation_error_degrees(e.rotation(), r_true);
        let trans_err = (e.translation() - t_true).norm();
        assert!(rot_err < 0.01, "camera {port} rotation error {rot_err}°");
        assert!(trans_err < 0.1, "camera {port} translation error {trans_err} mm");
    }

    // scale accuracy at the reference frame
    let scale = aligned.scale_accuracy(0).unwrap();
    assert!(scale.distance_rmse_mm < 0.5, "distance RMSE {} mm", scale.distance_rmse_mm);
    assert!(
        scale.relative_error_percent < 0.2,
        "relative error {} %",
        scale.relative_error_percent
    );
}

#[test]
fn noisy_bundle_adjustment_converges_to_truth() {
    // σ = 0.5 px observation noise; cameras perturbed by σ = 0.10 rad and
    // σ = 100 mm before refinement
    let scene = ring_scene();
    let noisy = add_pixel_noise(&scene.table, 0.5, 20_08);

    let mut rng = StdRng::seed_from_u64(77);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut sample3 = |sigma: f64| {
        Vector3::new(
            sigma * normal.sample(&mut rng),
            sigma * normal.sample(&mut rng),
            sigma * normal.sample(&mut rng),
        )
    };
    let rot_offsets: Vec<Vector3<f64>> = (0..4).map(|_| sample3(0.10)).collect();
    let trans_offsets: Vec<Vector3<f64>> = (0..4).map(|_| sample3(100.0)).collect();
    let start = synthetic::perturb_extrinsics(&scene.array, &rot_offsets, &trans_offsets);

    let ba_table = subsample_sync_indices(&noisy, BA_NTH);
    let seed = triangulate_table(&start, &ba_table).unwrap();
    let bundle = PointDataBundle::new(start.clone(), ba_table, seed).unwrap();

    let cfg = BundleConfig {
        ftol: 1e-8,
        max_iterations: 300,
        ..Default::default()
    };
    let optimized = bundle.optimize(&cfg).unwrap();
    bundle_adj::assert_cameras_moved(bundle.camera_array(), optimized.camera_array(), 1e-6);

    let rmse = optimized.rmse().unwrap();
    assert!(rmse < 0.85, "post-fit RMSE {rmse} px"); // noise floor ≈ 0.7 px

    let aligned = optimized.align_to_object(0).unwrap();
    let truth = truth_in_board_frame(&scene);
    for (port, cam) in aligned.camera_array().iter() {
        let e = cam.extrinsics().unwrap();
        let (r_true, t_true) = &truth[port];
        let rot_err = rotation_error_degrees(e.rotation(), r_true);
        let trans_err = (e.translation() - t_true).norm();
        assert!(rot_err < 0.5, "camera {port} rotation error {rot_err}°");
        assert!(trans_err < 10.0, "camera {port} translation error {trans_err} mm");
    }

    // scale accuracy at the reference frame under noise
    let scale = aligned.scale_accuracy(0).unwrap();
    assert!(
        scale.distance_rmse_mm < 2.0,
        "distance RMSE {} mm",
        scale.distance_rmse_mm
    );
    assert!(
        scale.relative_error_percent < 1.0,
        "relative error {} %",
        scale.relative_error_percent
    );
}

#[test]
fn stereo_pair_link_law_holds() {
    // pairs built from the true geometry: (0,1).link((1,2)) == (0,2)
    let scene = ring_scene();
    let rel = |a: u8, b: u8| -> StereoPair {
        let ea = scene.array.get(Port(a)).unwrap().extrinsics().unwrap().clone();
        let eb = scene.array.get(Port(b)).unwrap().extrinsics().unwrap().clone();
        let r = eb.rotation() * ea.rotation().transpose();
        let t = eb.translation() - r * ea.translation();
        StereoPair::new(Port(a), Port(b), 0.1, r, t).unwrap()
    };

    let p01 = rel(0, 1);
    let p12 = rel(1, 2);
    let p02 = rel(0, 2);

    let composed = p01.link(&p12).unwrap();
    assert_relative_eq!(composed.rotation(), p02.rotation(), epsilon = 1e-9);
    assert_relative_eq!(composed.translation(), p02.translation(), epsilon = 1e-9);
}

#[test]
fn bootstrapped_pairs_satisfy_link_law() {
    // the same law on pairs estimated from observations, at solver tolerance
    let scene = ring_scene();
    let intrinsics_only = without_extrinsics(&scene.array);
    let cfg = BootstrapConfig::default();

    let p01 = pose_graph::stereo_calibrate_pair(&intrinsics_only, &scene.table, Port(0), Port(1), &cfg)
        .unwrap();
    let p12 = pose_graph::stereo_calibrate_pair(&intrinsics_only, &scene.table, Port(1), Port(2), &cfg)
        .unwrap();
    let p02 = pose_graph::stereo_calibrate_pair(&intrinsics_only, &scene.table, Port(0), Port(2), &cfg)
        .unwrap();

    let composed = p01.link(&p12).unwrap();
    assert_relative_eq!(composed.rotation(), p02.rotation(), epsilon = 1e-4);
    let t_err = (composed.translation() - p02.translation()).norm();
    assert!(t_err < 1.0, "translation mismatch {t_err} mm");
}

#[test]
fn two_cameras_without_observations_cannot_initialize() {
    let array = synthetic::camera_ring(2, 800.0, 1920, 1080, 2000.0, 500.0);
    let bare = without_extrinsics(&array);
    match initialize_array(&bare, &[], &InitializerConfig::default()) {
        Err(pose_graph::PoseGraphError::ArrayInitializationIncomplete { orphan_ports }) => {
            assert_eq!(orphan_ports, vec![Port(0), Port(1)]);
        }
        other => panic!("expected ArrayInitializationIncomplete, got {other:?}"),
    }
}
