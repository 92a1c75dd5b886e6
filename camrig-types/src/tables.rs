//! Long-form observation tables exchanged between pipeline stages.
//!
//! `ImagePoints` is the 2-D observation table (one row per landmark seen by
//! one camera at one sync index); `WorldPoints` is the triangulated 3-D
//! table. Both round-trip through CSV with the exact column headers the rest
//! of the toolchain expects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::port::Port;

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("CSV error: {source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, TableError>;

/// One 2-D observation. Primary key `(sync_index, port, point_id)`.
///
/// `obj_loc_*` is only populated when the point comes from a calibration
/// target whose local geometry is known (charuco corners); generic landmark
/// trackers leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePoint {
    pub sync_index: u32,
    pub port: Port,
    pub frame_index: u32,
    pub frame_time: f64,
    pub point_id: u32,
    pub img_loc_x: f64,
    pub img_loc_y: f64,
    pub obj_loc_x: Option<f64>,
    pub obj_loc_y: Option<f64>,
    pub obj_loc_z: Option<f64>,
}

impl ImagePoint {
    #[inline]
    pub fn img_loc(&self) -> Point2<f64> {
        Point2::new(self.img_loc_x, self.img_loc_y)
    }

    /// Object-frame location, if all three components are present.
    pub fn obj_loc(&self) -> Option<Point3<f64>> {
        match (self.obj_loc_x, self.obj_loc_y, self.obj_loc_z) {
            (Some(x), Some(y), Some(z)) => Some(Point3::new(x, y, z)),
            _ => None,
        }
    }
}

/// Table of 2-D observations with unique `(sync_index, port, point_id)` rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagePoints {
    rows: Vec<ImagePoint>,
}

impl ImagePoints {
    pub fn new(rows: Vec<ImagePoint>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for row in rows.iter() {
            let key = (row.sync_index, row.port, row.point_id);
            if !seen.insert(key) {
                return Err(TableError::DuplicateKey {
                    table: "ImagePoints",
                    key: format!("{key:?}"),
                });
            }
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[ImagePoint] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ports(&self) -> BTreeSet<Port> {
        self.rows.iter().map(|r| r.port).collect()
    }

    pub fn sync_indices(&self) -> BTreeSet<u32> {
        self.rows.iter().map(|r| r.sync_index).collect()
    }

    /// Rows carrying known object-frame geometry (calibration-target
    /// observations).
    pub fn with_obj_loc(&self) -> impl Iterator<Item = &ImagePoint> {
        self.rows.iter().filter(|r| r.obj_loc().is_some())
    }

    /// Group observations as `sync_index → port → rows`, the shape the
    /// stereo bootstrap and triangulation stages walk.
    pub fn by_sync_and_port(&self) -> BTreeMap<u32, BTreeMap<Port, Vec<&ImagePoint>>> {
        let mut out: BTreeMap<u32, BTreeMap<Port, Vec<&ImagePoint>>> = BTreeMap::new();
        for row in self.rows.iter() {
            out.entry(row.sync_index)
                .or_default()
                .entry(row.port)
                .or_default()
                .push(row);
        }
        out
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for record in rdr.deserialize() {
            let row: ImagePoint = record?;
            rows.push(row);
        }
        Self::new(rows)
    }

    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for row in self.rows.iter() {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Fill small temporal gaps in each `(port, point_id)` track by linear
    /// interpolation across sync indices. Gaps longer than `max_gap` are left
    /// alone; interpolated rows never carry object locations.
    pub fn fill_gaps(&self, max_gap: u32) -> Self {
        let mut tracks: BTreeMap<(Port, u32), Vec<&ImagePoint>> = BTreeMap::new();
        for row in self.rows.iter() {
            tracks.entry((row.port, row.point_id)).or_default().push(row);
        }

        let mut filled = self.rows.clone();
        let mut n_filled = 0usize;
        for ((port, point_id), mut track) in tracks {
            track.sort_by_key(|r| r.sync_index);
            for pair in track.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                let gap = b.sync_index - a.sync_index;
                if gap < 2 || gap - 1 > max_gap {
                    continue;
                }
                for s in (a.sync_index + 1)..b.sync_index {
                    let t = f64::from(s - a.sync_index) / f64::from(gap);
                    filled.push(ImagePoint {
                        sync_index: s,
                        port,
                        frame_index: a.frame_index + (s - a.sync_index),
                        frame_time: a.frame_time + t * (b.frame_time - a.frame_time),
                        point_id,
                        img_loc_x: a.img_loc_x + t * (b.img_loc_x - a.img_loc_x),
                        img_loc_y: a.img_loc_y + t * (b.img_loc_y - a.img_loc_y),
                        obj_loc_x: None,
                        obj_loc_y: None,
                        obj_loc_z: None,
                    });
                    n_filled += 1;
                }
            }
        }
        if n_filled > 0 {
            tracing::info!("gap fill added {n_filled} interpolated observations");
        }
        filled.sort_by_key(|r| (r.sync_index, r.port, r.point_id));
        Self { rows: filled }
    }
}

/// One triangulated 3-D point. Primary key `(sync_index, point_id)`.
/// Coordinates are in the world frame, in millimetres.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldPoint {
    pub sync_index: u32,
    pub point_id: u32,
    pub frame_time: f64,
    pub x_coord: f64,
    pub y_coord: f64,
    pub z_coord: f64,
}

impl WorldPoint {
    #[inline]
    pub fn coords(&self) -> Point3<f64> {
        Point3::new(self.x_coord, self.y_coord, self.z_coord)
    }
}

/// Table of triangulated 3-D points with unique `(sync_index, point_id)` rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldPoints {
    rows: Vec<WorldPoint>,
}

impl WorldPoints {
    pub fn new(rows: Vec<WorldPoint>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for row in rows.iter() {
            let key = (row.sync_index, row.point_id);
            if !seen.insert(key) {
                return Err(TableError::DuplicateKey {
                    table: "WorldPoints",
                    key: format!("{key:?}"),
                });
            }
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[WorldPoint] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, sync_index: u32, point_id: u32) -> Option<&WorldPoint> {
        self.rows
            .iter()
            .find(|r| r.sync_index == sync_index && r.point_id == point_id)
    }

    /// All points at one sync index, ordered by point id.
    pub fn at_sync_index(&self, sync_index: u32) -> Vec<&WorldPoint> {
        let mut rows: Vec<&WorldPoint> = self
            .rows
            .iter()
            .filter(|r| r.sync_index == sync_index)
            .collect();
        rows.sort_by_key(|r| r.point_id);
        rows
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for record in rdr.deserialize() {
            let row: WorldPoint = record?;
            rows.push(row);
        }
        Self::new(rows)
    }

    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for row in self.rows.iter() {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sync_index: u32, port: u8, point_id: u32, x: f64) -> ImagePoint {
        ImagePoint {
            sync_index,
            port: Port(port),
            frame_index: sync_index,
            frame_time: sync_index as f64 / 30.0,
            point_id,
            img_loc_x: x,
            img_loc_y: 100.0,
            obj_loc_x: None,
            obj_loc_y: None,
            obj_loc_z: None,
        }
    }

    #[test]
    fn duplicate_keys_rejected() {
        let rows = vec![row(0, 0, 1, 10.0), row(0, 0, 1, 11.0)];
        assert!(matches!(
            ImagePoints::new(rows),
            Err(TableError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn csv_round_trip_preserves_optional_obj_loc() {
        let mut r0 = row(0, 0, 1, 10.0);
        r0.obj_loc_x = Some(50.0);
        r0.obj_loc_y = Some(0.0);
        r0.obj_loc_z = Some(0.0);
        let table = ImagePoints::new(vec![r0, row(1, 1, 2, 20.0)]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("point_data.csv");
        table.to_csv(&path).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "sync_index,port,frame_index,frame_time,point_id,\
             img_loc_x,img_loc_y,obj_loc_x,obj_loc_y,obj_loc_z"
        ));

        let back = ImagePoints::from_csv(&path).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.with_obj_loc().count(), 1);
    }

    #[test]
    fn gap_fill_interpolates_short_gaps_only() {
        let rows = vec![
            row(0, 0, 1, 10.0),
            row(3, 0, 1, 40.0),  // gap of 2 -> filled
            row(10, 0, 1, 50.0), // gap of 6 -> untouched
        ];
        let table = ImagePoints::new(rows).unwrap();
        let filled = table.fill_gaps(3);
        assert_eq!(filled.len(), 5);
        let r1 = filled
            .rows()
            .iter()
            .find(|r| r.sync_index == 1)
            .expect("interpolated row");
        approx::assert_relative_eq!(r1.img_loc_x, 20.0);
        assert!(r1.obj_loc().is_none());
        assert!(!filled.rows().iter().any(|r| r.sync_index == 5));
    }

    #[test]
    fn world_points_lookup() {
        let rows = vec![
            WorldPoint {
                sync_index: 0,
                point_id: 2,
                frame_time: 0.0,
                x_coord: 1.0,
                y_coord: 2.0,
                z_coord: 3.0,
            },
            WorldPoint {
                sync_index: 0,
                point_id: 1,
                frame_time: 0.0,
                x_coord: 4.0,
                y_coord: 5.0,
                z_coord: 6.0,
            },
        ];
        let table = WorldPoints::new(rows).unwrap();
        let at0 = table.at_sync_index(0);
        assert_eq!(at0.len(), 2);
        assert_eq!(at0[0].point_id, 1);
        assert_eq!(table.get(0, 2).unwrap().coords(), Point3::new(1.0, 2.0, 3.0));
    }
}
