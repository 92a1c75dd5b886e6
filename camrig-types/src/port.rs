use serde::{Deserialize, Serialize};

/// Identifier of a physical camera within a session.
///
/// Ports are small non-negative integers assigned by the capture layer.
/// Ordering is total so that `BTreeMap<Port, _>` iterates cameras in
/// ascending port order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Port(pub u8);

impl Port {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, fmt)
    }
}

impl From<u8> for Port {
    fn from(val: u8) -> Port {
        Port(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_iteration_order() {
        let mut map = std::collections::BTreeMap::new();
        for p in [3u8, 0, 7, 1] {
            map.insert(Port(p), ());
        }
        let ports: Vec<u8> = map.keys().map(|p| p.0).collect();
        assert_eq!(ports, vec![0, 1, 3, 7]);
    }

    #[test]
    fn serde_as_integer() {
        let buf = serde_json::to_string(&Port(2)).unwrap();
        assert_eq!(buf, "2");
        let back: Port = serde_json::from_str(&buf).unwrap();
        assert_eq!(back, Port(2));
    }
}
