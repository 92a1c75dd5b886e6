//! Frame admission for intrinsic calibration.

use nalgebra::{Point2, Point3};

use camrig_types::FramePacket;

/// One accepted view of the calibration board.
#[derive(Debug, Clone)]
pub struct BoardView {
    /// Corner locations in the board's local frame, z = 0, in mm.
    pub obj_loc: Vec<Point3<f64>>,
    /// Detected corner locations in raw pixel coordinates.
    pub img_loc: Vec<Point2<f64>>,
    pub frame_time: f64,
}

impl BoardView {
    pub fn len(&self) -> usize {
        self.img_loc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.img_loc.is_empty()
    }

    /// Board coordinates with the z = 0 component dropped, for homography
    /// estimation.
    pub fn obj_xy(&self) -> Vec<Point2<f64>> {
        self.obj_loc.iter().map(|p| Point2::new(p.x, p.y)).collect()
    }
}

/// Admits frames for calibration when enough corners are visible and enough
/// time has passed since the last accepted frame, so that the accepted views
/// are well spread instead of near-duplicates.
#[derive(Debug, Clone)]
pub struct ViewCollector {
    total_board_corners: u32,
    /// Fraction of the board that must be detected, typically 0.7-0.8.
    board_threshold: f64,
    /// Minimum seconds between accepted frames.
    wait_time: f64,
    last_accepted: Option<f64>,
    views: Vec<BoardView>,
}

impl ViewCollector {
    pub fn new(total_board_corners: u32, board_threshold: f64, wait_time: f64) -> Self {
        Self {
            total_board_corners,
            board_threshold,
            wait_time,
            last_accepted: None,
            views: Vec::new(),
        }
    }

    pub fn with_defaults(total_board_corners: u32) -> Self {
        Self::new(total_board_corners, 0.75, 0.5)
    }

    fn min_corners(&self) -> usize {
        (f64::from(self.total_board_corners) * self.board_threshold).floor() as usize
    }

    /// Offer a frame; returns `true` when it was accepted as a view.
    pub fn offer(&mut self, packet: &FramePacket) -> bool {
        let Some(points) = &packet.points else {
            return false;
        };
        let Some(obj_loc) = &points.obj_loc else {
            return false;
        };
        if points.len() < self.min_corners() {
            return false;
        }
        if let Some(last) = self.last_accepted {
            if packet.frame_time < last + self.wait_time {
                return false;
            }
        }

        self.last_accepted = Some(packet.frame_time);
        self.views.push(BoardView {
            obj_loc: obj_loc.clone(),
            img_loc: points.img_loc.clone(),
            frame_time: packet.frame_time,
        });
        true
    }

    pub fn views(&self) -> &[BoardView] {
        &self.views
    }

    pub fn grid_count(&self) -> u32 {
        self.views.len() as u32
    }
}
