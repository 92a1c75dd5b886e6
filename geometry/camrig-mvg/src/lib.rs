//! Camera geometry and multi-view geometry for the camrig calibration core.
//!
//! Builds on [`cam-geom`](https://crates.io/crates/cam-geom) for poses and
//! projection and [`opencv-ros-camera`](https://crates.io/crates/opencv-ros-camera)
//! for the 5-coefficient Brown-Conrady distortion model.
//!
//! ## Coordinate conventions
//!
//! One convention is used everywhere, the OpenCV projection form:
//!
//! ```text
//! x_cam = R * x_world + t
//! ```
//!
//! [`CameraExtrinsics::rotation`] maps world coordinates into the camera
//! frame and [`CameraExtrinsics::translation`] is the world origin expressed
//! in the camera frame, in millimetres. Serialization stores the same `R`
//! and `t`; the bundle-adjustment parameter vector packs `[rodrigues(R), t]`
//! with no inversion. Camera frame: X right, Y down, Z forward along the
//! optical axis. Image coordinates in pixels, origin top-left.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeomError {
    /// A programming bug: wrong shapes or broken rotation invariants.
    /// Always fatal for the current operation.
    #[error("shape or invariant violation: {what}")]
    ShapeOrInvariantViolation { what: String },
    #[error("insufficient observations: {what}")]
    InsufficientObservations { what: String },
    #[error("SVD failed")]
    SvdFailed,
    #[error("unknown camera port {0}")]
    UnknownCamera(camrig_types::Port),
    #[error("camera {0} has no extrinsics")]
    MissingExtrinsics(camrig_types::Port),
}

pub type Result<T> = std::result::Result<T, GeomError>;

pub mod align_points;
pub mod camera;
pub mod camera_array;
pub mod extrinsics;
pub mod homography;
pub mod reproj;
pub mod synthetic;
pub mod triangulate;

pub use align_points::{align_points, SimilarityTransform};
pub use camera::{CameraData, CameraIntrinsics};
pub use camera_array::CameraArray;
pub use extrinsics::CameraExtrinsics;
pub use reproj::{ReprojectionReport, ScaleAccuracy};
pub use triangulate::{triangulate_point, triangulate_table};
