//! Geometry of the charuco-style calibration target.
//!
//! The board is a planar grid of uniquely identifiable corners. Corner ids
//! run row-major over the interior chessboard corners; the local object frame
//! has its origin at corner 0 with x along columns, y along rows, z = 0.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::SubpixCriteria;

const MM_PER_INCH: f64 = 25.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardUnits {
    Inches,
    Mm,
}

/// Calibration board description, as persisted in the `charuco` subtable of
/// `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharucoBoard {
    /// Number of squares along the board's x direction.
    pub columns: u32,
    /// Number of squares along the board's y direction.
    pub rows: u32,
    pub board_height: f64,
    pub board_width: f64,
    /// Standard ArUco-style dictionary name, e.g. "DICT_4X4_50".
    pub dictionary: String,
    pub units: BoardUnits,
    /// Marker size as a fraction of the square size, 0 < x <= 1.
    pub aruco_scale: f64,
    /// When set, overrides the square size derived from the board dimensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_size_override_cm: Option<f64>,
    /// Whether detection should run on an inverted (white-on-black) image.
    pub inverted: bool,
    /// Corner localization criterion the detector must apply before handing
    /// observations to the calibrators.
    #[serde(default)]
    pub subpix: SubpixCriteria,
}

impl CharucoBoard {
    /// Number of uniquely identifiable interior corners.
    pub fn corner_count(&self) -> u32 {
        (self.columns - 1) * (self.rows - 1)
    }

    /// Edge length of one chessboard square in millimetres.
    pub fn square_size_mm(&self) -> f64 {
        if let Some(cm) = self.square_size_override_cm {
            return cm * 10.0;
        }
        let to_mm = match self.units {
            BoardUnits::Inches => MM_PER_INCH,
            BoardUnits::Mm => 1.0,
        };
        let square_w = self.board_width / f64::from(self.columns);
        let square_h = self.board_height / f64::from(self.rows);
        square_w.min(square_h) * to_mm
    }

    /// Location of a corner in the board's local object frame (mm, z = 0).
    ///
    /// Returns `None` for ids outside the board.
    pub fn object_location(&self, point_id: u32) -> Option<Point3<f64>> {
        if point_id >= self.corner_count() {
            return None;
        }
        let cols = self.columns - 1;
        let square = self.square_size_mm();
        let col = point_id % cols;
        let row = point_id / cols;
        Some(Point3::new(
            f64::from(col + 1) * square,
            f64::from(row + 1) * square,
            0.0,
        ))
    }

    /// All corner locations in id order.
    pub fn object_locations(&self) -> Vec<Point3<f64>> {
        (0..self.corner_count())
            .map(|id| self.object_location(id).unwrap())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> CharucoBoard {
        CharucoBoard {
            columns: 6,
            rows: 8,
            board_height: 8.0,
            board_width: 6.0,
            dictionary: "DICT_4X4_50".to_string(),
            units: BoardUnits::Inches,
            aruco_scale: 0.75,
            square_size_override_cm: None,
            inverted: false,
            subpix: SubpixCriteria::default(),
        }
    }

    #[test]
    fn corner_count_is_interior_grid() {
        assert_eq!(board().corner_count(), 35);
    }

    #[test]
    fn square_size_respects_override() {
        let mut b = board();
        approx::assert_relative_eq!(b.square_size_mm(), 25.4);
        b.square_size_override_cm = Some(5.0);
        approx::assert_relative_eq!(b.square_size_mm(), 50.0);
    }

    #[test]
    fn subpix_defaults_when_absent_from_serialized_form() {
        // boards persisted before the criterion was recorded deserialize
        // with the standard one
        let b = board();
        let mut json: serde_json::Value = serde_json::to_value(&b).unwrap();
        json.as_object_mut().unwrap().remove("subpix");
        let back: CharucoBoard = serde_json::from_value(json).unwrap();
        assert_eq!(back.subpix, SubpixCriteria::default());
        assert_eq!(back.subpix.max_iterations, 30);
        approx::assert_relative_eq!(back.subpix.epsilon, 1e-4);
    }

    #[test]
    fn object_locations_row_major() {
        let mut b = board();
        b.square_size_override_cm = Some(5.0);
        let p0 = b.object_location(0).unwrap();
        approx::assert_relative_eq!(p0.x, 50.0);
        approx::assert_relative_eq!(p0.y, 50.0);
        let p5 = b.object_location(5).unwrap();
        approx::assert_relative_eq!(p5.x, 50.0);
        approx::assert_relative_eq!(p5.y, 100.0);
        assert!(b.object_location(b.corner_count()).is_none());
        assert_eq!(b.object_locations().len(), 35);
    }
}
