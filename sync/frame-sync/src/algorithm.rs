//! The greedy forward-pass assignment of frames to sync groups.
//!
//! Each port keeps a cursor into its temporal frame sequence. At each step
//! two quantities are computed per port from the *other* ports' cursors: the
//! earliest next-frame time and the latest current-frame time. A port's
//! current frame joins the group unless it belongs later: either because a
//! frame at another port's next layer precedes it, or because it sits closer
//! in time to the next group than to the current one. The pass is
//! deterministic: identical timestamp input yields identical assignments.

use std::collections::BTreeMap;

use camrig_types::Port;

/// One emitted sync group: for every port, the index of the frame assigned
/// to this group, or `None` for a dropped slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncGroup {
    pub sync_index: u32,
    pub slots: BTreeMap<Port, Option<usize>>,
}

/// Assign every frame of every port to a sync group.
///
/// `frames_by_port` holds each port's frame times in capture order (the
/// caller sorts when reconstructing from disk). Returns the ordered list of
/// groups with strictly increasing `sync_index`; a group is emitted only if
/// at least one port contributed a frame.
pub fn sync_timestamps(frames_by_port: &BTreeMap<Port, Vec<f64>>) -> Vec<SyncGroup> {
    let ports: Vec<Port> = frames_by_port.keys().copied().collect();
    let mut cursors: BTreeMap<Port, usize> = ports.iter().map(|p| (*p, 0usize)).collect();

    let exhausted = |cursors: &BTreeMap<Port, usize>, p: Port| -> bool {
        cursors[&p] >= frames_by_port[&p].len()
    };

    let mut groups = Vec::new();
    let mut sync_index = 0u32;

    while ports.iter().any(|p| !exhausted(&cursors, *p)) {
        // current candidate frame time per non-exhausted port
        let candidates: BTreeMap<Port, f64> = ports
            .iter()
            .filter(|p| !exhausted(&cursors, **p))
            .map(|p| (*p, frames_by_port[p][cursors[p]]))
            .collect();

        // both bounds must be computed before any cursor moves
        let earliest_next: BTreeMap<Port, f64> = ports
            .iter()
            .map(|p| (*p, earliest_next_frame(*p, &cursors, frames_by_port)))
            .collect();
        let latest_current: BTreeMap<Port, f64> = ports
            .iter()
            .map(|p| (*p, latest_current_frame(*p, &cursors, frames_by_port)))
            .collect();

        let mut slots: BTreeMap<Port, Option<usize>> = BTreeMap::new();
        for port in ports.iter() {
            let Some(&frame_time) = candidates.get(port) else {
                slots.insert(*port, None);
                continue;
            };

            // a frame at another port's next layer precedes this one
            if frame_time > earliest_next[port] {
                slots.insert(*port, None);
                continue;
            }
            // closer to the next group than to the current one
            if earliest_next[port] - frame_time < frame_time - latest_current[port] {
                slots.insert(*port, None);
                continue;
            }

            slots.insert(*port, Some(cursors[port]));
            *cursors.get_mut(port).unwrap() += 1;
        }

        if slots.values().any(|s| s.is_some()) {
            groups.push(SyncGroup { sync_index, slots });
            sync_index += 1;
        } else if let Some((&min_port, _)) = candidates
            .iter()
            .min_by(|(_, ta), (_, tb)| ta.partial_cmp(tb).unwrap())
        {
            // nothing assigned: advance the smallest candidate to avoid a stall
            *cursors.get_mut(&min_port).unwrap() += 1;
        } else {
            break;
        }
    }

    groups
}

/// Minimum next-frame (cursor + 1) time across the *other* ports; +inf when
/// every other port is out of lookahead.
fn earliest_next_frame(
    port: Port,
    cursors: &BTreeMap<Port, usize>,
    frames_by_port: &BTreeMap<Port, Vec<f64>>,
) -> f64 {
    let mut earliest = f64::INFINITY;
    for (p, cursor) in cursors.iter() {
        if *p == port {
            continue;
        }
        let next = cursor + 1;
        if let Some(&t) = frames_by_port[p].get(next) {
            earliest = earliest.min(t);
        }
    }
    earliest
}

/// Maximum current-frame time across the *other* ports; -inf when every
/// other port is exhausted.
fn latest_current_frame(
    port: Port,
    cursors: &BTreeMap<Port, usize>,
    frames_by_port: &BTreeMap<Port, Vec<f64>>,
) -> f64 {
    let mut latest = f64::NEG_INFINITY;
    for (p, cursor) in cursors.iter() {
        if *p == port {
            continue;
        }
        if let Some(&t) = frames_by_port[p].get(*cursor) {
            latest = latest.max(t);
        }
    }
    latest
}
