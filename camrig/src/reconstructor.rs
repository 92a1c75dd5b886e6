//! 3-D reconstruction of recorded 2-D landmark trajectories.
//!
//! Operates on a recording directory: loads the tracker's `xy_*.csv`
//! observation table, optionally fills small gaps, triangulates against the
//! calibrated camera array, and writes the long-form and wide-form xyz
//! outputs plus the camera array actually used.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use camrig_mvg::{triangulate_table, CameraArray};
use camrig_types::{ImagePoints, WorldPoints};

use crate::config::save_camera_array;
use crate::{Result, SessionError};

#[derive(Debug, Clone)]
pub struct ReconstructorOptions {
    /// Maximum (x,y) gap length filled by linear interpolation; 0 disables.
    pub xy_gap_fill: u32,
}

impl Default for ReconstructorOptions {
    fn default() -> Self {
        Self { xy_gap_fill: 3 }
    }
}

/// Reconstructs 3-D landmark trajectories for one tracker's output within a
/// recording directory.
pub struct Reconstructor {
    camera_array: CameraArray,
    recording_path: PathBuf,
    tracker_name: String,
}

impl Reconstructor {
    pub fn new<P: AsRef<Path>>(
        camera_array: CameraArray,
        recording_path: P,
        tracker_name: &str,
    ) -> Self {
        Self {
            camera_array,
            recording_path: recording_path.as_ref().to_path_buf(),
            tracker_name: tracker_name.to_string(),
        }
    }

    fn tracker_dir(&self) -> PathBuf {
        self.recording_path.join(&self.tracker_name)
    }

    /// Triangulate the tracker's 2-D table into world points and write
    /// `xyz_{tracker}.csv`, `xyz_{tracker}_labelled.csv`, and the camera
    /// array used. Returns the world point table.
    pub fn create_xyz(
        &self,
        point_names: &BTreeMap<u32, String>,
        opts: &ReconstructorOptions,
    ) -> Result<WorldPoints> {
        let tracker_dir = self.tracker_dir();
        std::fs::create_dir_all(&tracker_dir)
            .map_err(|e| SessionError::io(&tracker_dir, e))?;

        let xy_path = tracker_dir.join(format!("xy_{}.csv", self.tracker_name));
        tracing::info!("loading 2-D observations from {}", xy_path.display());
        let xy = ImagePoints::from_csv(&xy_path)?;
        if xy.is_empty() {
            return Err(SessionError::InsufficientObservations {
                what: format!("no observations in {}", xy_path.display()),
            });
        }

        let xy = if opts.xy_gap_fill > 0 {
            xy.fill_gaps(opts.xy_gap_fill)
        } else {
            xy
        };

        tracing::info!("triangulating {} observations", xy.len());
        let xyz = triangulate_table(&self.camera_array, &xy)?;
        if xyz.is_empty() {
            return Err(SessionError::InsufficientObservations {
                what: "no point was observed by two or more cameras".to_string(),
            });
        }

        // serialize the camera array actually used for this reconstruction
        save_camera_array(tracker_dir.join("camera_array.toml"), &self.camera_array)?;

        let xyz_path = tracker_dir.join(format!("xyz_{}.csv", self.tracker_name));
        xyz.to_csv(&xyz_path)?;
        tracing::info!("wrote {}", xyz_path.display());

        let labelled_path = tracker_dir.join(format!("xyz_{}_labelled.csv", self.tracker_name));
        write_wide_labelled(&labelled_path, &xyz, point_names)?;
        tracing::info!("wrote {}", labelled_path.display());

        Ok(xyz)
    }
}

/// Wide-form export: one row per sync index, one `{name}_x/_y/_z` column
/// triple per tracked point.
pub fn write_wide_labelled<P: AsRef<Path>>(
    path: P,
    world_points: &WorldPoints,
    point_names: &BTreeMap<u32, String>,
) -> Result<()> {
    let path = path.as_ref();

    let mut point_ids: Vec<u32> = world_points.rows().iter().map(|r| r.point_id).collect();
    point_ids.sort_unstable();
    point_ids.dedup();

    let name_of = |id: u32| -> String {
        point_names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("point_{id}"))
    };

    let mut wtr = csv::Writer::from_path(path).map_err(|e| SessionError::IOFailure {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;

    let mut header = vec!["sync_index".to_string()];
    for id in point_ids.iter() {
        let name = name_of(*id);
        header.push(format!("{name}_x"));
        header.push(format!("{name}_y"));
        header.push(format!("{name}_z"));
    }
    wtr.write_record(&header)
        .map_err(|e| SessionError::IOFailure {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;

    let mut by_sync: BTreeMap<u32, BTreeMap<u32, [f64; 3]>> = BTreeMap::new();
    for row in world_points.rows() {
        by_sync
            .entry(row.sync_index)
            .or_default()
            .insert(row.point_id, [row.x_coord, row.y_coord, row.z_coord]);
    }

    for (sync_index, points) in by_sync.iter() {
        let mut record = vec![sync_index.to_string()];
        for id in point_ids.iter() {
            match points.get(id) {
                Some([x, y, z]) => {
                    record.push(x.to_string());
                    record.push(y.to_string());
                    record.push(z.to_string());
                }
                None => {
                    record.push(String::new());
                    record.push(String::new());
                    record.push(String::new());
                }
            }
        }
        wtr.write_record(&record)
            .map_err(|e| SessionError::IOFailure {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })?;
    }
    wtr.flush().map_err(|e| SessionError::io(path, e))?;
    Ok(())
}
