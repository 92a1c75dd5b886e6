//! The persisted `config.toml`: board description, per-camera calibration
//! state (`cam_{p}` subtables), and stereo calibration results
//! (`stereo_{a}_{b}` subtables).

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use camrig_mvg::extrinsics::CameraExtrinsics;
use camrig_mvg::{CameraArray, CameraData, CameraIntrinsics};
use camrig_types::{CharucoBoard, Port};
use pose_graph::StereoPair;

use crate::{Result, SessionError};

/// One `cam_{p}` subtable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub port: u8,
    /// `[W, H]`
    pub size: [usize; 2],
    #[serde(default)]
    pub rotation_count: i8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<i64>,
    /// 3×3 camera matrix, row major.
    pub matrix: Vec<Vec<f64>>,
    /// `[k1, k2, p1, p2, k3]`
    pub distortions: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Vec<Vec<f64>>>,
    /// RMSE of the intrinsic fit, unrounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_count: Option<u32>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verified_resolutions: Vec<[u32; 2]>,
}

/// One `stereo_{a}_{b}` subtable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoConfig {
    pub rotation: Vec<Vec<f64>>,
    pub translation: Vec<f64>,
    #[serde(rename = "RMSE", alias = "error")]
    pub rmse: f64,
}

/// In-memory form of `config.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub charuco: CharucoBoard,
    pub cameras: BTreeMap<Port, CameraConfig>,
    pub stereo: BTreeMap<(Port, Port), StereoConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| SessionError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = self.to_toml_string()?;
        std::fs::write(path, text).map_err(|e| SessionError::io(path, e))?;
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(text)?;
        let table = value.as_table().ok_or_else(|| SessionError::Config {
            what: "config root is not a table".to_string(),
        })?;

        let charuco: CharucoBoard = table
            .get("charuco")
            .cloned()
            .ok_or_else(|| SessionError::Config {
                what: "missing [charuco] table".to_string(),
            })?
            .try_into()?;

        let mut cameras = BTreeMap::new();
        let mut stereo = BTreeMap::new();
        for (key, value) in table.iter() {
            let mut parts = key.split('_');
            match parts.next() {
                Some("cam") => {
                    let port: u8 = parts
                        .next()
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| SessionError::Config {
                            what: format!("bad camera key {key}"),
                        })?;
                    let cam: CameraConfig = value.clone().try_into()?;
                    cameras.insert(Port(port), cam);
                }
                Some("stereo") => {
                    let a: u8 = parts
                        .next()
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| SessionError::Config {
                            what: format!("bad stereo key {key}"),
                        })?;
                    let b: u8 = parts
                        .next()
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| SessionError::Config {
                            what: format!("bad stereo key {key}"),
                        })?;
                    let entry: StereoConfig = value.clone().try_into()?;
                    stereo.insert((Port(a), Port(b)), entry);
                }
                _ => {}
            }
        }

        Ok(Self {
            charuco,
            cameras,
            stereo,
        })
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let mut root = toml::value::Table::new();
        root.insert("charuco".to_string(), toml::Value::try_from(&self.charuco)?);
        for (port, cam) in self.cameras.iter() {
            root.insert(format!("cam_{port}"), toml::Value::try_from(cam)?);
        }
        for ((a, b), entry) in self.stereo.iter() {
            root.insert(format!("stereo_{a}_{b}"), toml::Value::try_from(entry)?);
        }
        Ok(toml::to_string(&toml::Value::Table(root))?)
    }

    /// Build the runtime camera array from the persisted state.
    pub fn camera_array(&self) -> Result<CameraArray> {
        let mut array = CameraArray::default();
        for (port, cam) in self.cameras.iter() {
            array.insert(camera_from_config(*port, cam)?);
        }
        Ok(array)
    }

    /// Write calibration results back into the persisted form.
    pub fn update_from_array(&mut self, array: &CameraArray) {
        for (port, cam) in array.iter() {
            self.cameras.insert(*port, camera_to_config(cam));
        }
    }

    pub fn update_stereo(&mut self, pairs: &[StereoPair]) {
        for pair in pairs.iter() {
            self.stereo.insert(
                pair.pair(),
                StereoConfig {
                    rotation: matrix_rows(pair.rotation()),
                    translation: pair.translation().iter().copied().collect(),
                    rmse: pair.error_score(),
                },
            );
        }
    }

    pub fn stereo_pairs(&self) -> Result<Vec<StereoPair>> {
        self.stereo
            .iter()
            .map(|((a, b), entry)| {
                Ok(StereoPair::new(
                    *a,
                    *b,
                    entry.rmse,
                    matrix_from_rows(&entry.rotation)?,
                    vector_from_slice(&entry.translation)?,
                )?)
            })
            .collect()
    }
}

pub(crate) fn matrix_rows(m: &Matrix3<f64>) -> Vec<Vec<f64>> {
    (0..3)
        .map(|r| (0..3).map(|c| m[(r, c)]).collect())
        .collect()
}

pub(crate) fn matrix_from_rows(rows: &[Vec<f64>]) -> Result<Matrix3<f64>> {
    if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
        return Err(SessionError::Config {
            what: "matrix is not 3x3".to_string(),
        });
    }
    let mut m = Matrix3::zeros();
    for (r, row) in rows.iter().enumerate() {
        for (c, v) in row.iter().enumerate() {
            m[(r, c)] = *v;
        }
    }
    Ok(m)
}

pub(crate) fn vector_from_slice(v: &[f64]) -> Result<Vector3<f64>> {
    if v.len() != 3 {
        return Err(SessionError::Config {
            what: format!("translation has {} components, expected 3", v.len()),
        });
    }
    Ok(Vector3::new(v[0], v[1], v[2]))
}

pub(crate) fn camera_from_config(port: Port, cam: &CameraConfig) -> Result<CameraData> {
    if cam.distortions.len() != 5 {
        return Err(SessionError::Config {
            what: format!(
                "camera {port} has {} distortion coefficients, expected 5",
                cam.distortions.len()
            ),
        });
    }
    let matrix = matrix_from_rows(&cam.matrix)?;
    let mut distortions = [0.0; 5];
    distortions.copy_from_slice(&cam.distortions);

    let intrinsics = CameraIntrinsics::from_matrix_and_distortions(
        cam.size[0],
        cam.size[1],
        &matrix,
        &distortions,
    );
    let mut data = CameraData::new(port, intrinsics);
    data.rotation_count = cam.rotation_count;
    data.exposure = cam.exposure;
    data.error = cam.error;
    data.grid_count = cam.grid_count;
    data.ignore = cam.ignore;
    data.verified_resolutions = cam
        .verified_resolutions
        .iter()
        .map(|[w, h]| (*w, *h))
        .collect();

    if let (Some(rotation), Some(translation)) = (&cam.rotation, &cam.translation) {
        data.extrinsics = Some(CameraExtrinsics::new(
            matrix_from_rows(rotation)?,
            vector_from_slice(translation)?,
        )?);
    }
    Ok(data)
}

pub(crate) fn camera_to_config(cam: &CameraData) -> CameraConfig {
    CameraConfig {
        port: cam.port.0,
        size: [cam.intrinsics.width(), cam.intrinsics.height()],
        rotation_count: cam.rotation_count,
        exposure: cam.exposure,
        matrix: matrix_rows(&cam.intrinsics.matrix()),
        distortions: cam.intrinsics.distortions().to_vec(),
        translation: cam
            .extrinsics
            .as_ref()
            .map(|e| e.translation().iter().copied().collect()),
        rotation: cam.extrinsics.as_ref().map(|e| matrix_rows(e.rotation())),
        error: cam.error,
        grid_count: cam.grid_count,
        ignore: cam.ignore,
        verified_resolutions: cam
            .verified_resolutions
            .iter()
            .map(|(w, h)| [*w, *h])
            .collect(),
    }
}

/// Serialize a calibrated array on its own (`camera_array.toml`).
pub fn save_camera_array<P: AsRef<Path>>(path: P, array: &CameraArray) -> Result<()> {
    let path = path.as_ref();
    let mut root = toml::value::Table::new();
    for (port, cam) in array.iter() {
        root.insert(
            format!("cam_{port}"),
            toml::Value::try_from(camera_to_config(cam))?,
        );
    }
    let text = toml::to_string(&toml::Value::Table(root))?;
    std::fs::write(path, text).map_err(|e| SessionError::io(path, e))?;
    Ok(())
}

pub fn load_camera_array<P: AsRef<Path>>(path: P) -> Result<CameraArray> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| SessionError::io(path, e))?;
    let value: toml::Value = toml::from_str(&text)?;
    let table = value.as_table().ok_or_else(|| SessionError::Config {
        what: "camera array root is not a table".to_string(),
    })?;

    let mut array = CameraArray::default();
    for (key, value) in table.iter() {
        let Some(port) = key.strip_prefix("cam_").and_then(|p| p.parse::<u8>().ok()) else {
            continue;
        };
        let cam: CameraConfig = value.clone().try_into()?;
        array.insert(camera_from_config(Port(port), &cam)?);
    }
    Ok(array)
}
