use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{Point2, Point3};

use crate::port::Port;
use crate::tables::ImagePoint;

/// Raw image payload attached to a [`FramePacket`].
///
/// The core never inspects pixel data; it only moves frames between the
/// synchronizer and its subscribers (recorders, viewers). Data is shared so
/// that fan-out to multiple subscriber queues does not copy the image.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub data: Arc<[u8]>,
}

/// Per-frame output of a landmark tracker: parallel arrays of point IDs,
/// image locations, and (for calibration targets with known local geometry)
/// object-frame locations.
///
/// Tracker-assigned IDs are stable across frames and disjoint across trackers
/// by offset convention.
#[derive(Debug, Clone, Default)]
pub struct PointPacket {
    pub point_id: Vec<u32>,
    pub img_loc: Vec<Point2<f64>>,
    pub obj_loc: Option<Vec<Point3<f64>>>,
    pub confidence: Option<Vec<f32>>,
}

impl PointPacket {
    pub fn len(&self) -> usize {
        self.point_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_id.is_empty()
    }
}

/// A single captured frame with its monotonic timestamp and, once a tracker
/// has run, the landmarks found in it.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub port: Port,
    pub frame_index: u32,
    pub frame_time: f64,
    pub image: Option<ImageData>,
    pub points: Option<PointPacket>,
}

impl FramePacket {
    /// Expand the tracker output into long-form observation rows for the
    /// given sync index. Returns an empty vector when no points were found.
    pub fn tidy_rows(&self, sync_index: u32) -> Vec<ImagePoint> {
        let Some(points) = &self.points else {
            return Vec::new();
        };
        let mut rows = Vec::with_capacity(points.len());
        for (i, &point_id) in points.point_id.iter().enumerate() {
            let obj = points.obj_loc.as_ref().map(|o| o[i]);
            rows.push(ImagePoint {
                sync_index,
                port: self.port,
                frame_index: self.frame_index,
                frame_time: self.frame_time,
                point_id,
                img_loc_x: points.img_loc[i].x,
                img_loc_y: points.img_loc[i].y,
                obj_loc_x: obj.map(|p| p.x),
                obj_loc_y: obj.map(|p| p.y),
                obj_loc_z: obj.map(|p| p.z),
            });
        }
        rows
    }
}

/// One synchronized frame group: at most one frame per port, `None` marking a
/// dropped frame at that port.
#[derive(Debug, Clone)]
pub struct SyncPacket {
    pub sync_index: u32,
    pub frame_packets: BTreeMap<Port, Option<FramePacket>>,
}

impl SyncPacket {
    /// The inputs the triangulation stage consumes: for every reported 2-D
    /// point, the observing port, the point id, and the image location.
    pub fn triangulation_inputs(&self) -> (Vec<Port>, Vec<u32>, Vec<Point2<f64>>) {
        let mut ports = Vec::new();
        let mut point_ids = Vec::new();
        let mut img_xy = Vec::new();
        for (port, packet) in self.frame_packets.iter() {
            let Some(packet) = packet else { continue };
            let Some(points) = &packet.points else {
                continue;
            };
            for (i, &id) in points.point_id.iter().enumerate() {
                ports.push(*port);
                point_ids.push(id);
                img_xy.push(points.img_loc[i]);
            }
        }
        (ports, point_ids, img_xy)
    }

    /// Which ports dropped their frame in this group.
    pub fn dropped(&self) -> BTreeMap<Port, bool> {
        self.frame_packets
            .iter()
            .map(|(port, packet)| (*port, packet.is_none()))
            .collect()
    }

    pub fn frame_packet_count(&self) -> usize {
        self.frame_packets.values().filter(|p| p.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_points(port: u8, ids: &[u32]) -> FramePacket {
        FramePacket {
            port: Port(port),
            frame_index: 0,
            frame_time: 0.5,
            image: None,
            points: Some(PointPacket {
                point_id: ids.to_vec(),
                img_loc: ids.iter().map(|&i| Point2::new(i as f64, 2.0)).collect(),
                obj_loc: None,
                confidence: None,
            }),
        }
    }

    #[test]
    fn triangulation_inputs_skip_dropped_ports() {
        let mut frame_packets = BTreeMap::new();
        frame_packets.insert(Port(0), Some(packet_with_points(0, &[4, 5])));
        frame_packets.insert(Port(1), None);
        frame_packets.insert(Port(2), Some(packet_with_points(2, &[5])));
        let sp = SyncPacket {
            sync_index: 7,
            frame_packets,
        };

        let (ports, ids, xy) = sp.triangulation_inputs();
        assert_eq!(ports, vec![Port(0), Port(0), Port(2)]);
        assert_eq!(ids, vec![4, 5, 5]);
        assert_eq!(xy.len(), 3);
        assert_eq!(sp.frame_packet_count(), 2);
        assert_eq!(sp.dropped()[&Port(1)], true);
    }

    #[test]
    fn tidy_rows_carry_object_locations() {
        let mut packet = packet_with_points(1, &[0, 1]);
        packet.points.as_mut().unwrap().obj_loc =
            Some(vec![Point3::new(0.0, 0.0, 0.0), Point3::new(50.0, 0.0, 0.0)]);
        let rows = packet.tidy_rows(3);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sync_index, 3);
        assert_eq!(rows[1].obj_loc_x, Some(50.0));
        assert_eq!(rows[0].obj_loc_z, Some(0.0));
    }
}
