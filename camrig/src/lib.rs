//! Session orchestration for the camrig motion-capture calibration core.
//!
//! A *workspace* directory holds `config.toml`, calibration videos, and
//! recordings. This crate loads and persists that state, drives the
//! calibration pipeline (intrinsics → stereo bootstrap → array
//! initialization → bundle adjustment → gauge alignment), and reconstructs
//! 3-D landmark trajectories from recorded 2-D observations.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("IO failure on {}: {cause}", path.display())]
    IOFailure { path: PathBuf, cause: String },
    #[error("task cancelled")]
    Cancelled,
    #[error("bad configuration: {what}")]
    Config { what: String },
    #[error("insufficient observations: {what}")]
    InsufficientObservations { what: String },
    #[error(transparent)]
    Table(#[from] camrig_types::tables::TableError),
    #[error(transparent)]
    Geom(#[from] camrig_mvg::GeomError),
    #[error(transparent)]
    GridCal(#[from] gridcal::GridCalError),
    #[error(transparent)]
    PoseGraph(#[from] pose_graph::PoseGraphError),
    #[error(transparent)]
    BundleAdj(#[from] bundle_adj::BundleAdjError),
    #[error(transparent)]
    Sync(#[from] frame_sync::SyncError),
    #[error("TOML parse error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialize error: {source}")]
    TomlSer {
        #[from]
        source: toml::ser::Error,
    },
}

impl SessionError {
    pub fn io<P: Into<PathBuf>>(path: P, err: std::io::Error) -> Self {
        Self::IOFailure {
            path: path.into(),
            cause: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

pub mod config;
pub mod paths;
pub mod reconstructor;
pub mod session;

pub use config::Config;
pub use paths::WorkspacePaths;
pub use reconstructor::Reconstructor;
pub use session::{CalibrationOutcome, ExtrinsicOptions, Progress, Session};
