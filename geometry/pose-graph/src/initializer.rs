//! Combining pairwise stereo transforms into a single world frame.
//!
//! The stereo pairs (plus their inverted forms) are a directed multigraph on
//! ports. The camera with the lowest mean outgoing error score anchors the
//! world frame; every other camera receives the composition of pair
//! transforms along a low-error spanning tree from the anchor.

use std::collections::BTreeMap;

use camrig_mvg::extrinsics::CameraExtrinsics;
use camrig_mvg::CameraArray;
use camrig_types::Port;

use crate::stereo_pair::StereoPair;
use crate::{PoseGraphError, Result};

#[derive(Debug, Clone)]
pub struct InitializerConfig {
    /// Maximum per-leg error score admitted during two-hop gap filling.
    pub max_bridge_leg_error: f64,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            max_bridge_leg_error: 5.0,
        }
    }
}

/// Assign every non-ignored camera an extrinsic pose in the anchor's frame.
///
/// Returns a new array; the anchor camera gets identity extrinsics. When some
/// ports cannot be reached even after two-hop gap filling, the error lists
/// them so the caller can collect more data or disable those cameras.
pub fn initialize_array(
    array: &CameraArray,
    pairs: &[StereoPair],
    cfg: &InitializerConfig,
) -> Result<CameraArray> {
    let ports: Vec<Port> = array
        .iter()
        .filter(|(_, cam)| !cam.ignore)
        .map(|(port, _)| *port)
        .collect();

    if pairs.is_empty() {
        return Err(PoseGraphError::ArrayInitializationIncomplete {
            orphan_ports: ports,
        });
    }

    // Augment with inverted pairs: a directed multigraph on ports.
    let mut edges: Vec<StereoPair> = pairs.to_vec();
    edges.extend(pairs.iter().map(|p| p.invert()));

    let anchor = select_anchor(&edges);
    tracing::info!("anchor camera: port {anchor}");

    // Grow the spanning tree from the anchor, always taking the lowest-error
    // edge that reaches a new port.
    let mut transforms: BTreeMap<Port, Option<StereoPair>> = BTreeMap::new();
    transforms.insert(anchor, None); // identity
    grow_tree(&mut transforms, &edges)?;

    // Two-hop gap fill for ports the tree could not reach: compose pairs of
    // good edges into new candidate edges and retry until no progress.
    loop {
        let missing: Vec<Port> = ports
            .iter()
            .copied()
            .filter(|p| !transforms.contains_key(p))
            .collect();
        if missing.is_empty() {
            break;
        }

        let mut bridged = Vec::new();
        for first in edges.iter() {
            if first.error_score() > cfg.max_bridge_leg_error {
                continue;
            }
            for second in edges.iter() {
                if second.error_score() > cfg.max_bridge_leg_error {
                    continue;
                }
                if first.secondary_port() != second.primary_port()
                    || first.primary_port() == second.secondary_port()
                {
                    continue;
                }
                if !missing.contains(&second.secondary_port()) {
                    continue;
                }
                bridged.push(first.link(second)?);
            }
        }
        if bridged.is_empty() {
            break;
        }
        tracing::debug!("gap fill materialized {} bridged edges", bridged.len());
        edges.extend(bridged);
        grow_tree(&mut transforms, &edges)?;

        let still_missing = ports
            .iter()
            .filter(|p| !transforms.contains_key(p))
            .count();
        if still_missing == missing.len() {
            break; // bridging made no progress
        }
    }

    let orphan_ports: Vec<Port> = ports
        .iter()
        .copied()
        .filter(|p| !transforms.contains_key(p))
        .collect();
    if !orphan_ports.is_empty() {
        return Err(PoseGraphError::ArrayInitializationIncomplete { orphan_ports });
    }

    let mut out = array.clone();
    for port in ports {
        let cam = out.get_mut(port).expect("port came from the array");
        cam.extrinsics = Some(match &transforms[&port] {
            None => CameraExtrinsics::identity(),
            Some(pair) => CameraExtrinsics::new(*pair.rotation(), *pair.translation())?,
        });
    }
    Ok(out)
}

/// The port with the smallest mean error score over its outgoing edges, ties
/// broken by lowest port number.
fn select_anchor(edges: &[StereoPair]) -> Port {
    let mut sums: BTreeMap<Port, (f64, usize)> = BTreeMap::new();
    for edge in edges.iter() {
        let e = sums.entry(edge.primary_port()).or_insert((0.0, 0));
        e.0 += edge.error_score();
        e.1 += 1;
    }
    sums.into_iter()
        .map(|(port, (sum, n))| (port, sum / n as f64))
        .min_by(|(pa, ea), (pb, eb)| ea.partial_cmp(eb).unwrap().then(pa.cmp(pb)))
        .map(|(port, _)| port)
        .expect("edges are non-empty")
}

/// Attach every reachable port to the tree, preferring the lowest-error edge
/// out of the connected set at each step.
fn grow_tree(
    transforms: &mut BTreeMap<Port, Option<StereoPair>>,
    edges: &[StereoPair],
) -> Result<()> {
    loop {
        let mut best: Option<&StereoPair> = None;
        for edge in edges.iter() {
            if !transforms.contains_key(&edge.primary_port())
                || transforms.contains_key(&edge.secondary_port())
            {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => edge.error_score() < b.error_score(),
            };
            if better {
                best = Some(edge);
            }
        }
        let Some(edge) = best else {
            return Ok(());
        };

        let composed = match &transforms[&edge.primary_port()] {
            None => edge.clone(), // edge out of the anchor itself
            Some(to_primary) => to_primary.link(edge)?,
        };
        transforms.insert(edge.secondary_port(), Some(composed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use camrig_mvg::synthetic;
    use nalgebra::{Matrix3, Rotation3, Vector3};

    fn pair(a: u8, b: u8, rvec: Vector3<f64>, t: Vector3<f64>, err: f64) -> StereoPair {
        StereoPair::new(Port(a), Port(b), err, Rotation3::new(rvec).into_inner(), t).unwrap()
    }

    /// True relative transform a→b for a posed array.
    fn relative(array: &CameraArray, a: u8, b: u8) -> (Matrix3<f64>, Vector3<f64>) {
        let ea = array.get(Port(a)).unwrap().extrinsics().unwrap().clone();
        let eb = array.get(Port(b)).unwrap().extrinsics().unwrap().clone();
        let r = eb.rotation() * ea.rotation().transpose();
        let t = eb.translation() - r * ea.translation();
        (r, t)
    }

    #[test]
    fn no_pairs_reports_all_ports_orphaned() {
        let array = synthetic::camera_ring(2, 800.0, 1920, 1080, 2000.0, 500.0);
        match initialize_array(&array, &[], &InitializerConfig::default()) {
            Err(PoseGraphError::ArrayInitializationIncomplete { orphan_ports }) => {
                assert_eq!(orphan_ports, vec![Port(0), Port(1)]);
            }
            other => panic!("expected ArrayInitializationIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn anchor_prefers_lowest_mean_error_then_lowest_port() {
        let edges = vec![
            pair(0, 1, Vector3::zeros(), Vector3::zeros(), 0.4),
            pair(1, 0, Vector3::zeros(), Vector3::zeros(), 0.4),
            pair(1, 2, Vector3::zeros(), Vector3::zeros(), 0.2),
            pair(2, 1, Vector3::zeros(), Vector3::zeros(), 0.2),
        ];
        // port 1 mean = 0.3, port 0 mean = 0.4, port 2 mean = 0.2
        assert_eq!(select_anchor(&edges), Port(2));
    }

    #[test]
    fn recovers_ring_geometry_relative_to_anchor() {
        let array = synthetic::camera_ring(4, 800.0, 1920, 1080, 2000.0, 500.0);
        // Build exact pairs from the true geometry on a sparse graph:
        // 0-1, 1-2, 2-3 (no direct edge to complete the ring).
        let mut pairs = Vec::new();
        for (a, b) in [(0u8, 1u8), (1, 2), (2, 3)] {
            let (r, t) = relative(&array, a, b);
            pairs.push(StereoPair::new(Port(a), Port(b), 0.1, r, t).unwrap());
        }

        let mut bare = array.clone();
        for port in bare.ports() {
            bare.get_mut(port).unwrap().extrinsics = None;
        }
        let initialized =
            initialize_array(&bare, &pairs, &InitializerConfig::default()).unwrap();

        // every relative transform must match the truth regardless of which
        // camera anchored the frame
        for (a, b) in [(0u8, 1u8), (0, 2), (0, 3), (1, 3)] {
            let (r_true, t_true) = relative(&array, a, b);
            let (r_est, t_est) = relative(&initialized, a, b);
            assert_relative_eq!(r_est, r_true, epsilon = 1e-9);
            assert_relative_eq!(t_est, t_true, epsilon = 1e-6);
        }

        // exactly one camera sits at the identity
        let identities = initialized
            .iter()
            .filter(|(_, cam)| {
                let e = cam.extrinsics.as_ref().unwrap();
                (e.rotation() - Matrix3::identity()).norm() < 1e-9
                    && e.translation().norm() < 1e-6
            })
            .count();
        assert_eq!(identities, 1);
    }

    #[test]
    fn sparse_chain_composes_through_intermediate() {
        let array = synthetic::camera_ring(3, 800.0, 1920, 1080, 2000.0, 500.0);
        let (r01, t01) = relative(&array, 0, 1);
        let (r12, t12) = relative(&array, 1, 2);

        // no direct 0-2 edge: the anchor reaches port 2 only through port 1
        let pairs = vec![
            StereoPair::new(Port(0), Port(1), 0.1, r01, t01).unwrap(),
            StereoPair::new(Port(1), Port(2), 0.2, r12, t12).unwrap(),
        ];

        let mut bare = array.clone();
        for port in bare.ports() {
            bare.get_mut(port).unwrap().extrinsics = None;
        }
        let initialized = initialize_array(&bare, &pairs, &InitializerConfig::default()).unwrap();
        let (r_true, t_true) = relative(&array, 0, 2);
        let (r_est, t_est) = relative(&initialized, 0, 2);
        assert_relative_eq!(r_est, r_true, epsilon = 1e-9);
        assert_relative_eq!(t_est, t_true, epsilon = 1e-6);
    }
}
