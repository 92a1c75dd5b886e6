//! Reconstructing per-port frame cursors from `frame_time_history.csv`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use camrig_types::Port;

use crate::{Result, SyncError};

/// The columns this loader cares about; recorded files may carry more, which
/// are tolerated and ignored.
#[derive(Debug, Deserialize)]
struct FrameTimeRow {
    port: Port,
    frame_time: f64,
}

/// Load per-port frame times from a `frame_time_history.csv`, sorted into
/// temporal order per port, ready for [`crate::sync_timestamps`].
pub fn load_frame_time_history<P: AsRef<Path>>(path: P) -> Result<BTreeMap<Port, Vec<f64>>> {
    let path = path.as_ref();
    let mut rdr = csv::Reader::from_path(path).map_err(|e| SyncError::IOFailure {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;

    let mut frames: BTreeMap<Port, Vec<f64>> = BTreeMap::new();
    for record in rdr.deserialize() {
        let row: FrameTimeRow = record?;
        frames.entry(row.port).or_default().push(row.frame_time);
    }
    if frames.is_empty() {
        return Err(SyncError::NoFrames);
    }
    for series in frames.values_mut() {
        series.sort_by(|a, b| a.partial_cmp(b).unwrap());
    }
    Ok(frames)
}
