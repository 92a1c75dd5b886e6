//! Shared data model for the camrig motion-capture calibration core.
//!
//! This crate holds the types that cross component boundaries: camera port
//! identifiers, per-frame tracker packets, the synchronized frame groups
//! emitted by the synchronizer, and the long-form observation tables
//! (`ImagePoints`, `WorldPoints`) that the calibration and triangulation
//! stages exchange via CSV.

pub mod charuco;
pub mod packets;
pub mod port;
pub mod tables;

pub use charuco::CharucoBoard;
pub use packets::{FramePacket, ImageData, PointPacket, SyncPacket};
pub use port::Port;
pub use tables::{ImagePoint, ImagePoints, WorldPoint, WorldPoints};

/// Corner localization criterion handed to external landmark detectors.
///
/// Sub-pixel refinement happens upstream of this crate (in the detector
/// plug-ins), but the criterion is part of the calibration contract:
/// [`CharucoBoard::subpix`] persists it in the `charuco` subtable of
/// `config.toml` so the session can hand it to the detectors it spawns.
/// Refinement iterates until either bound is hit (max iterations, or a step
/// smaller than `epsilon` pixels).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SubpixCriteria {
    pub max_iterations: u32,
    pub epsilon: f64,
}

impl Default for SubpixCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            epsilon: 1e-4,
        }
    }
}
