//! The calibrated camera collection shared by every pipeline stage.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use camrig_types::Port;

use crate::align_points::SimilarityTransform;
use crate::camera::CameraData;
use crate::extrinsics::CameraExtrinsics;
use crate::{GeomError, Result};

/// Mapping `port → CameraData`. Iteration always yields cameras in ascending
/// port order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraArray {
    cameras: BTreeMap<Port, CameraData>,
}

impl CameraArray {
    pub fn new(cameras: BTreeMap<Port, CameraData>) -> Self {
        Self { cameras }
    }

    pub fn insert(&mut self, camera: CameraData) {
        self.cameras.insert(camera.port, camera);
    }

    pub fn get(&self, port: Port) -> Option<&CameraData> {
        self.cameras.get(&port)
    }

    pub fn get_mut(&mut self, port: Port) -> Option<&mut CameraData> {
        self.cameras.get_mut(&port)
    }

    pub fn require(&self, port: Port) -> Result<&CameraData> {
        self.cameras.get(&port).ok_or(GeomError::UnknownCamera(port))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Port, &CameraData)> {
        self.cameras.iter()
    }

    pub fn ports(&self) -> Vec<Port> {
        self.cameras.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Cameras that are posed and not marked `ignore`.
    pub fn calibrated(&self) -> impl Iterator<Item = (&Port, &CameraData)> {
        self.cameras
            .iter()
            .filter(|(_, cam)| !cam.ignore && cam.extrinsics.is_some())
    }

    /// Apply a similarity transform to every posed camera, returning a new
    /// array. World points `x` map as `x' = s·R·x + t`; each camera keeps
    /// projecting the transformed scene to the same pixels up to scale.
    pub fn transformed(&self, xform: &SimilarityTransform) -> Result<Self> {
        let mut cameras = self.cameras.clone();
        for cam in cameras.values_mut() {
            let Some(e) = &cam.extrinsics else { continue };
            cam.extrinsics = Some(transform_extrinsics(e, xform)?);
        }
        Ok(Self { cameras })
    }
}

fn transform_extrinsics(
    e: &CameraExtrinsics,
    xform: &SimilarityTransform,
) -> Result<CameraExtrinsics> {
    // Move the camera center with the scene and counter-rotate the pose.
    let center = e.camera_center();
    let new_center: Vector3<f64> =
        xform.scale * (xform.rotation * center.coords) + xform.translation;
    let new_rotation: Matrix3<f64> = e.rotation() * xform.rotation.transpose();
    let new_translation = -(new_rotation * new_center);
    CameraExtrinsics::new(new_rotation, new_translation)
}
