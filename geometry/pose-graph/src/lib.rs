//! Pairwise extrinsics bootstrap and its combination into a common frame.
//!
//! For every camera pair that co-observed enough calibration boards, the
//! relative pose and a stereo reprojection RMSE are estimated
//! ([`bootstrap`]); the resulting [`StereoPair`] records form a directed
//! multigraph over ports from which a spanning tree rooted at the
//! best-connected ("anchor") camera assigns every camera a pose in one world
//! frame ([`initializer`]).

use camrig_types::Port;

#[derive(thiserror::Error, Debug)]
pub enum PoseGraphError {
    #[error("stereo pair {pair:?} below threshold: {shared_boards} shared boards")]
    StereoPairBelowThreshold {
        pair: (Port, Port),
        shared_boards: usize,
    },
    #[error("array initialization incomplete; orphan ports {orphan_ports:?}")]
    ArrayInitializationIncomplete { orphan_ports: Vec<Port> },
    #[error("insufficient observations: {what}")]
    InsufficientObservations { what: String },
    #[error(transparent)]
    Geom(#[from] camrig_mvg::GeomError),
}

pub type Result<T> = std::result::Result<T, PoseGraphError>;

pub mod bootstrap;
pub mod initializer;
pub mod stereo_pair;

pub use bootstrap::{stereo_calibrate_pair, stereo_calibrate_pairs, BootstrapConfig};
pub use initializer::{initialize_array, InitializerConfig};
pub use stereo_pair::StereoPair;
