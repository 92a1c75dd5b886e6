//! Cross-camera frame synchronization.
//!
//! Cameras free-run: each produces a monotone stream of timestamped frames
//! with independent phase and jitter. The synchronizer assigns a monotone
//! `sync_index` to each near-simultaneous group of frames via a greedy
//! forward pass over per-port cursors ([`algorithm`]), either offline from
//! recorded timestamps ([`timestamps`]) or live from reel queues feeding a
//! bundler thread ([`runtime`]).

use camrig_types::Port;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("task cancelled")]
    Cancelled,
    #[error("IO failure on {}: {cause}", path.display())]
    IOFailure { path: std::path::PathBuf, cause: String },
    #[error("no frames for any port")]
    NoFrames,
    #[error("CSV error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;

pub mod algorithm;
pub mod runtime;
pub mod timestamps;

pub use algorithm::{sync_timestamps, SyncGroup};
pub use runtime::{ReelStream, StopToken, Synchronizer, SynchronizerConfig};
pub use timestamps::load_frame_time_history;

/// Convenience: the set of ports appearing in a sync result.
pub fn ports_of(groups: &[SyncGroup]) -> Vec<Port> {
    groups
        .first()
        .map(|g| g.slots.keys().copied().collect())
        .unwrap_or_default()
}
