//! Filesystem layout of a camrig workspace.
//!
//! ```text
//! workspace/
//!   config.toml
//!   calibration/intrinsic/port_{p}.mp4
//!   calibration/extrinsic/port_{p}.mp4
//!   calibration/extrinsic/point_data.csv
//!   recordings/{session}/port_{p}.mp4
//!   recordings/{session}/frame_time_history.csv
//!   recordings/{session}/config.toml            (archived copy)
//!   recordings/{session}/{tracker}/xy_{tracker}.csv
//!   recordings/{session}/{tracker}/xyz_{tracker}.csv
//!   recordings/{session}/{tracker}/xyz_{tracker}_labelled.csv
//!   recordings/{session}/{tracker}/camera_array.toml
//! ```

use std::path::{Path, PathBuf};

use camrig_types::Port;

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn intrinsic_dir(&self) -> PathBuf {
        self.root.join("calibration").join("intrinsic")
    }

    pub fn extrinsic_dir(&self) -> PathBuf {
        self.root.join("calibration").join("extrinsic")
    }

    pub fn intrinsic_video(&self, port: Port) -> PathBuf {
        self.intrinsic_dir().join(format!("port_{port}.mp4"))
    }

    pub fn extrinsic_video(&self, port: Port) -> PathBuf {
        self.extrinsic_dir().join(format!("port_{port}.mp4"))
    }

    pub fn point_data(&self) -> PathBuf {
        self.extrinsic_dir().join("point_data.csv")
    }

    pub fn recording_dir(&self, session_name: &str) -> PathBuf {
        self.root.join("recordings").join(session_name)
    }

    pub fn recording_video(&self, session_name: &str, port: Port) -> PathBuf {
        self.recording_dir(session_name).join(format!("port_{port}.mp4"))
    }

    pub fn frame_time_history(&self, session_name: &str) -> PathBuf {
        self.recording_dir(session_name).join("frame_time_history.csv")
    }

    pub fn tracker_dir(&self, session_name: &str, tracker_name: &str) -> PathBuf {
        self.recording_dir(session_name).join(tracker_name)
    }

    pub fn xy_csv(&self, session_name: &str, tracker_name: &str) -> PathBuf {
        self.tracker_dir(session_name, tracker_name)
            .join(format!("xy_{tracker_name}.csv"))
    }

    pub fn xyz_csv(&self, session_name: &str, tracker_name: &str) -> PathBuf {
        self.tracker_dir(session_name, tracker_name)
            .join(format!("xyz_{tracker_name}.csv"))
    }

    pub fn xyz_labelled_csv(&self, session_name: &str, tracker_name: &str) -> PathBuf {
        self.tracker_dir(session_name, tracker_name)
            .join(format!("xyz_{tracker_name}_labelled.csv"))
    }

    pub fn tracker_camera_array(&self, session_name: &str, tracker_name: &str) -> PathBuf {
        self.tracker_dir(session_name, tracker_name)
            .join("camera_array.toml")
    }

    pub fn archived_config(&self, session_name: &str) -> PathBuf {
        self.recording_dir(session_name).join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_convention() {
        let p = WorkspacePaths::new("/tmp/ws");
        assert_eq!(
            p.intrinsic_video(Port(2)),
            PathBuf::from("/tmp/ws/calibration/intrinsic/port_2.mp4")
        );
        assert_eq!(
            p.xyz_labelled_csv("walk01", "pose"),
            PathBuf::from("/tmp/ws/recordings/walk01/pose/xyz_pose_labelled.csv")
        );
        assert_eq!(
            p.frame_time_history("walk01"),
            PathBuf::from("/tmp/ws/recordings/walk01/frame_time_history.csv")
        );
    }
}
