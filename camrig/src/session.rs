//! The session: owner of the camera array and point tables, and driver of
//! the calibration pipeline.

use std::collections::BTreeMap;

use crossbeam_channel::Sender;

use bundle_adj::{BundleConfig, PointDataBundle};
use camrig_mvg::{CameraArray, ReprojectionReport, ScaleAccuracy};
use camrig_types::{FramePacket, ImagePoint, ImagePoints, PointPacket, Port};
use frame_sync::StopToken;
use gridcal::{IntrinsicConfig, ViewCollector};
use pose_graph::{
    initialize_array, stereo_calibrate_pairs, BootstrapConfig, InitializerConfig, StereoPair,
};

use crate::config::Config;
use crate::paths::WorkspacePaths;
use crate::{Result, SessionError};

/// Progress of a long-running operation, surfaced to the caller's UI.
#[derive(Debug, Clone)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

fn report(progress: Option<&Sender<Progress>>, percent: u8, message: impl Into<String>) {
    let message = message.into();
    tracing::info!("[{percent:3}%] {message}");
    if let Some(tx) = progress {
        let _ = tx.send(Progress { percent, message });
    }
}

fn check_stop(stop: Option<&StopToken>) -> Result<()> {
    if stop.map(|s| s.is_stopped()).unwrap_or(false) {
        return Err(SessionError::Cancelled);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExtrinsicOptions {
    pub bootstrap: BootstrapConfig,
    pub initializer: InitializerConfig,
    pub bundle: BundleConfig,
    /// Run the cull/re-optimize outer loop.
    pub use_culling: bool,
    /// Sync index used for gauge alignment; `None` skips alignment.
    pub alignment_sync_index: Option<u32>,
    /// Use only every n-th sync index during bundle adjustment (1 = all).
    pub use_nth_sync_index: u32,
}

impl Default for ExtrinsicOptions {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapConfig::default(),
            initializer: InitializerConfig::default(),
            bundle: BundleConfig::default(),
            use_culling: false,
            alignment_sync_index: Some(0),
            use_nth_sync_index: 1,
        }
    }
}

/// Everything the extrinsic stage produces.
pub struct CalibrationOutcome {
    pub bundle: PointDataBundle,
    pub pairs: Vec<StereoPair>,
    pub report: ReprojectionReport,
    pub scale: Option<ScaleAccuracy>,
}

/// A camrig session: persisted configuration plus workspace paths. Owns the
/// camera array and any bundle derived from it; pipeline stages take
/// references and return new values.
pub struct Session {
    pub paths: WorkspacePaths,
    pub config: Config,
}

impl Session {
    pub fn load(paths: WorkspacePaths) -> Result<Self> {
        let config = Config::load(paths.config())?;
        Ok(Self { paths, config })
    }

    pub fn camera_array(&self) -> Result<CameraArray> {
        self.config.camera_array()
    }

    /// Calibrate one camera's intrinsics from calibration-target
    /// observations, and record the result in the configuration.
    pub fn calibrate_intrinsics(
        &mut self,
        image_points: &ImagePoints,
        port: Port,
        cfg: &IntrinsicConfig,
    ) -> Result<gridcal::IntrinsicFit> {
        let cam = self.config.cameras.get(&port).ok_or_else(|| {
            SessionError::Config {
                what: format!("no cam_{port} entry in config"),
            }
        })?;
        let (width, height) = (cam.size[0], cam.size[1]);

        let subpix = self.config.charuco.subpix;
        tracing::debug!(
            "port {port}: expecting corners refined to {} px in at most {} iterations",
            subpix.epsilon,
            subpix.max_iterations
        );

        let mut collector = ViewCollector::with_defaults(self.config.charuco.corner_count());
        for packet in packets_for_port(image_points, port) {
            collector.offer(&packet);
        }
        tracing::info!(
            "port {port}: {} views admitted for intrinsic calibration",
            collector.grid_count()
        );

        let fit = gridcal::calibrate(port, width, height, collector.views(), cfg)?;

        let entry = self.config.cameras.get_mut(&port).expect("checked above");
        entry.matrix = crate::config::matrix_rows(&fit.intrinsics.matrix());
        entry.distortions = fit.intrinsics.distortions().to_vec();
        entry.error = Some(fit.rmse);
        entry.grid_count = Some(fit.grid_count);
        self.config.save(self.paths.config())?;
        Ok(fit)
    }

    /// The extrinsic stage: stereo bootstrap → array initialization → seed
    /// triangulation → bundle adjustment → gauge alignment → reporting.
    ///
    /// Configuration is only updated (and saved) after every step succeeds,
    /// so cancellation or failure leaves the prior state intact.
    pub fn calibrate_extrinsics(
        &mut self,
        image_points: &ImagePoints,
        opts: &ExtrinsicOptions,
        progress: Option<&Sender<Progress>>,
        stop: Option<&StopToken>,
    ) -> Result<CalibrationOutcome> {
        let array = self.config.camera_array()?;

        check_stop(stop)?;
        report(progress, 5, "estimating stereo pairs");
        let pairs = stereo_calibrate_pairs(&array, image_points, &opts.bootstrap);
        if pairs.is_empty() {
            return Err(SessionError::InsufficientObservations {
                what: "no camera pair had enough shared boards".to_string(),
            });
        }

        check_stop(stop)?;
        report(progress, 25, "initializing camera array");
        let initialized = initialize_array(&array, &pairs, &opts.initializer)?;

        check_stop(stop)?;
        report(progress, 35, "triangulating seed points");
        let ba_points = subsample_sync_indices(image_points, opts.use_nth_sync_index);
        let seed = camrig_mvg::triangulate_table(&initialized, &ba_points)?;

        check_stop(stop)?;
        report(progress, 45, "bundle adjustment");
        let bundle = PointDataBundle::new(initialized, ba_points, seed)?;
        let optimized = if opts.use_culling {
            bundle.optimize_with_culling(&opts.bundle)?
        } else {
            bundle.optimize(&opts.bundle)?
        };

        check_stop(stop)?;
        let (aligned, scale) = match opts.alignment_sync_index {
            Some(sync_index) => {
                report(progress, 80, "aligning to object coordinates");
                let aligned = optimized.align_to_object(sync_index)?;
                let scale = aligned.scale_accuracy(sync_index)?;
                (aligned, Some(scale))
            }
            None => (optimized, None),
        };

        report(progress, 90, "computing reprojection report");
        let reprojection = aligned.reprojection_report()?;
        tracing::info!(
            "extrinsic calibration RMSE: {:.4} px over {} observations",
            reprojection.overall_rmse,
            reprojection.n_observations
        );

        // commit: update persisted state only now
        self.config.update_from_array(aligned.camera_array());
        self.config.update_stereo(&pairs);
        self.config.save(self.paths.config())?;
        report(progress, 100, "extrinsic calibration complete");

        Ok(CalibrationOutcome {
            bundle: aligned,
            pairs,
            report: reprojection,
            scale,
        })
    }
}

/// Rebuild per-frame packets for one port from the observation table, in
/// sync-index order, so the admission gate sees the stream shape it expects.
pub fn packets_for_port(image_points: &ImagePoints, port: Port) -> Vec<FramePacket> {
    let mut by_sync: BTreeMap<u32, Vec<&ImagePoint>> = BTreeMap::new();
    for row in image_points.rows() {
        if row.port == port {
            by_sync.entry(row.sync_index).or_default().push(row);
        }
    }

    by_sync
        .into_iter()
        .map(|(_, rows)| {
            let first = rows[0];
            FramePacket {
                port,
                frame_index: first.frame_index,
                frame_time: first.frame_time,
                image: None,
                points: Some(PointPacket {
                    point_id: rows.iter().map(|r| r.point_id).collect(),
                    img_loc: rows.iter().map(|r| r.img_loc()).collect(),
                    obj_loc: rows
                        .iter()
                        .map(|r| r.obj_loc())
                        .collect::<Option<Vec<_>>>(),
                    confidence: None,
                }),
            }
        })
        .collect()
}

/// Keep only every n-th sync index (n = 1 keeps everything), the standard
/// downsampling for large bundle-adjustment problems.
pub fn subsample_sync_indices(image_points: &ImagePoints, nth: u32) -> ImagePoints {
    if nth <= 1 {
        return image_points.clone();
    }
    let rows: Vec<ImagePoint> = image_points
        .rows()
        .iter()
        .filter(|r| r.sync_index % nth == 0)
        .cloned()
        .collect();
    ImagePoints::new(rows).expect("subsampling preserves key uniqueness")
}

#[cfg(test)]
mod tests {
    use super::*;
    use camrig_mvg::synthetic;

    #[test]
    fn packets_group_rows_per_sync_index() {
        let array = synthetic::camera_ring(2, 800.0, 1920, 1080, 2000.0, 500.0);
        let board = synthetic::board_grid(3, 3, 60.0);
        let poses = synthetic::helix_poses(4);
        let table = synthetic::project_scene(&array, &board, &poses);

        let packets = packets_for_port(&table, Port(0));
        assert_eq!(packets.len(), 4);
        for p in packets.iter() {
            let points = p.points.as_ref().unwrap();
            assert_eq!(points.len(), 9);
            assert!(points.obj_loc.is_some());
        }
    }

    #[test]
    fn subsampling_keeps_every_nth_index() {
        let array = synthetic::camera_ring(2, 800.0, 1920, 1080, 2000.0, 500.0);
        let board = synthetic::board_grid(3, 3, 60.0);
        let poses = synthetic::helix_poses(10);
        let table = synthetic::project_scene(&array, &board, &poses);

        let sub = subsample_sync_indices(&table, 4);
        let indices = sub.sync_indices();
        assert_eq!(indices.into_iter().collect::<Vec<u32>>(), vec![0, 4, 8]);
    }

    #[test]
    fn cancellation_restores_nothing_and_reports_cancelled() {
        let token = StopToken::new();
        token.stop();
        assert!(matches!(
            check_stop(Some(&token)),
            Err(SessionError::Cancelled)
        ));
    }
}
