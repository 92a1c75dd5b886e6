//! The live synchronizer: one bundler thread consuming per-port reel queues
//! and fanning out [`SyncPacket`]s to subscriber queues.
//!
//! Capture and tracker threads are external collaborators; their only
//! surface here is a bounded channel of [`FramePacket`]s per port, plus an
//! optional `shutter_sync` channel the bundler fires to pace capture at the
//! target FPS.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use camrig_types::{FramePacket, Port, SyncPacket};

/// Cooperative cancellation flag shared with worker threads. Long sleeps
/// must poll it at a bounded interval.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep in bounded slices, returning `true` if stopped meanwhile.
    pub fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.is_stopped() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(Duration::from_secs(1)));
        }
        self.is_stopped()
    }
}

/// One camera's connection to the synchronizer.
pub struct ReelStream {
    /// Timestamped frames in capture order.
    pub reel: Receiver<FramePacket>,
    /// When present, the bundler sends one message per frame the capture
    /// side should read, pacing it to the FPS target.
    pub shutter_sync: Option<Sender<()>>,
}

#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Target frames per second; capture advance is paused while the running
    /// average exceeds it. `None` runs unthrottled.
    pub fps_target: Option<f64>,
    /// Bounded wait for a lagging reel before its slot is declared dropped.
    pub reel_timeout: Duration,
    /// Capacity of each subscriber queue.
    pub subscriber_capacity: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            fps_target: None,
            reel_timeout: Duration::from_millis(200),
            subscriber_capacity: 64,
        }
    }
}

/// Live frame synchronizer. Build with [`Synchronizer::new`], register
/// subscribers, then [`Synchronizer::spawn`] the bundler thread.
pub struct Synchronizer {
    streams: BTreeMap<Port, ReelStream>,
    cfg: SynchronizerConfig,
    subscribers: Vec<Sender<SyncPacket>>,
    stop: StopToken,
}

impl Synchronizer {
    pub fn new(streams: BTreeMap<Port, ReelStream>, cfg: SynchronizerConfig) -> Self {
        Self {
            streams,
            cfg,
            subscribers: Vec::new(),
            stop: StopToken::new(),
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Register a subscriber; every `SyncPacket` from the point of
    /// subscription onward is delivered to the returned queue.
    pub fn subscribe(&mut self) -> Receiver<SyncPacket> {
        let (tx, rx) = bounded(self.cfg.subscriber_capacity);
        self.subscribers.push(tx);
        rx
    }

    /// Start the bundler thread. It runs until every reel is exhausted or
    /// the stop token fires.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("frame-sync-bundler".to_string())
            .spawn(move || bundler_loop(self))
            .expect("spawn bundler thread")
    }
}

struct PortState {
    reel: Receiver<FramePacket>,
    shutter_sync: Option<Sender<()>>,
    buffer: VecDeque<FramePacket>,
    disconnected: bool,
}

impl PortState {
    fn exhausted(&self) -> bool {
        self.disconnected && self.buffer.is_empty()
    }

    /// Ensure `depth` frames are buffered, waiting up to `timeout` in total.
    /// Returns false when the reel lags (bounded wait expired).
    fn fill_to(&mut self, depth: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.buffer.len() < depth && !self.disconnected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.reel.recv_timeout(remaining) {
                Ok(packet) => self.buffer.push_back(packet),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => self.disconnected = true,
            }
        }
        true
    }
}

fn bundler_loop(sync: Synchronizer) {
    let Synchronizer {
        streams,
        cfg,
        subscribers,
        stop,
    } = sync;

    let mut states: BTreeMap<Port, PortState> = streams
        .into_iter()
        .map(|(port, s)| {
            (
                port,
                PortState {
                    reel: s.reel,
                    shutter_sync: s.shutter_sync,
                    buffer: VecDeque::new(),
                    disconnected: false,
                },
            )
        })
        .collect();
    let ports: Vec<Port> = states.keys().copied().collect();

    // prime capture: two frames of lookahead are needed before bundling
    for state in states.values() {
        if let Some(shutter) = &state.shutter_sync {
            let _ = shutter.send(());
            let _ = shutter.send(());
        }
    }

    let mut sync_index = 0u32;
    let mut recent_group_times: VecDeque<f64> = VecDeque::new();
    let mut last_fire = Instant::now();

    loop {
        if stop.is_stopped() {
            tracing::info!("synchronizer stopping on request");
            return;
        }
        if states.values().all(|s| s.exhausted()) {
            tracing::info!("all reels exhausted after {sync_index} sync groups");
            return;
        }

        // pace capture to the FPS target when slack is low
        let min_slack = states.values().map(|s| s.buffer.len()).min().unwrap_or(0);
        if min_slack < 2 {
            if let Some(fps) = cfg.fps_target {
                let wait = Duration::from_secs_f64(1.0 / fps);
                let since = last_fire.elapsed();
                if since < wait {
                    if stop.sleep_unless_stopped(wait - since) {
                        return;
                    }
                }
            }
            last_fire = Instant::now();
            for state in states.values() {
                if let Some(shutter) = &state.shutter_sync {
                    let _ = shutter.send(());
                }
            }
        }

        // bounded wait for two frames of lookahead on every live port
        for state in states.values_mut() {
            state.fill_to(2, cfg.reel_timeout);
        }

        let current_time = |state: &PortState| state.buffer.front().map(|f| f.frame_time);
        let next_time = |state: &PortState| state.buffer.get(1).map(|f| f.frame_time);

        let earliest_next: BTreeMap<Port, f64> = ports
            .iter()
            .map(|p| {
                let t = states
                    .iter()
                    .filter(|(other, _)| *other != p)
                    .filter_map(|(_, s)| next_time(s))
                    .fold(f64::INFINITY, f64::min);
                (*p, t)
            })
            .collect();
        let latest_current: BTreeMap<Port, f64> = ports
            .iter()
            .map(|p| {
                let t = states
                    .iter()
                    .filter(|(other, _)| *other != p)
                    .filter_map(|(_, s)| current_time(s))
                    .fold(f64::NEG_INFINITY, f64::max);
                (*p, t)
            })
            .collect();

        let mut frame_packets: BTreeMap<Port, Option<FramePacket>> = BTreeMap::new();
        let mut group_times = Vec::new();
        for port in ports.iter() {
            let state = states.get_mut(port).unwrap();
            let Some(frame_time) = current_time(state) else {
                frame_packets.insert(*port, None);
                continue;
            };
            if frame_time > earliest_next[port]
                || earliest_next[port] - frame_time < frame_time - latest_current[port]
            {
                tracing::debug!("skipping frame at port {port}: belongs to a later group");
                frame_packets.insert(*port, None);
                continue;
            }
            let packet = state.buffer.pop_front().expect("current frame exists");
            group_times.push(frame_time);
            frame_packets.insert(*port, Some(packet));
        }

        if group_times.is_empty() {
            // advance the smallest candidate to avoid a stall
            let candidate = ports
                .iter()
                .filter_map(|p| current_time(&states[p]).map(|t| (*p, t)))
                .min_by(|(_, ta), (_, tb)| ta.partial_cmp(tb).unwrap());
            if let Some((port, _)) = candidate {
                let state = states.get_mut(&port).unwrap();
                state.buffer.pop_front();
            }
            continue;
        }

        let mean_time = group_times.iter().sum::<f64>() / group_times.len() as f64;
        recent_group_times.push_back(mean_time);
        while recent_group_times.len() > 10 {
            recent_group_times.pop_front();
        }

        let packet = SyncPacket {
            sync_index,
            frame_packets,
        };
        sync_index += 1;
        for tx in subscribers.iter() {
            // a full subscriber queue applies backpressure rather than
            // dropping packets
            if tx.send(packet.clone()).is_err() {
                tracing::debug!("subscriber queue closed");
            }
        }
    }
}

/// Running average FPS over the most recent group times; used by displays.
pub fn average_fps(mean_group_times: &[f64]) -> Option<f64> {
    if mean_group_times.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = mean_group_times.windows(2).map(|w| w[1] - w[0]).collect();
    let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
    if mean > 0.0 {
        Some(1.0 / mean)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::sync_timestamps;

    fn frame(port: u8, frame_index: u32, frame_time: f64) -> FramePacket {
        FramePacket {
            port: Port(port),
            frame_index,
            frame_time,
            image: None,
            points: None,
        }
    }

    #[test]
    fn live_bundling_matches_offline_algorithm() {
        let times: BTreeMap<Port, Vec<f64>> = [
            (Port(0), (0..40).map(|i| i as f64 / 30.0).collect()),
            (
                Port(1),
                (0..40).map(|i| i as f64 / 30.0 + 0.003).collect::<Vec<f64>>(),
            ),
        ]
        .into_iter()
        .collect();

        let mut streams = BTreeMap::new();
        let mut senders = Vec::new();
        for (port, series) in times.iter() {
            let (tx, rx) = bounded(64);
            senders.push((*port, tx, series.clone()));
            streams.insert(
                *port,
                ReelStream {
                    reel: rx,
                    shutter_sync: None,
                },
            );
        }

        let mut sync = Synchronizer::new(streams, SynchronizerConfig::default());
        let packets = sync.subscribe();
        let handle = sync.spawn();

        let feeders: Vec<_> = senders
            .into_iter()
            .map(|(port, tx, series)| {
                std::thread::spawn(move || {
                    for (i, t) in series.iter().enumerate() {
                        tx.send(frame(port.0, i as u32, *t)).unwrap();
                    }
                    // dropping tx closes the reel
                })
            })
            .collect();
        for f in feeders {
            f.join().unwrap();
        }

        let mut live: Vec<(u32, Vec<(Port, Option<u32>)>)> = Vec::new();
        while let Ok(packet) = packets.recv_timeout(Duration::from_secs(5)) {
            live.push((
                packet.sync_index,
                packet
                    .frame_packets
                    .iter()
                    .map(|(p, f)| (*p, f.as_ref().map(|f| f.frame_index)))
                    .collect(),
            ));
        }
        handle.join().unwrap();

        let offline = sync_timestamps(&times);
        assert_eq!(live.len(), offline.len());
        for (l, o) in live.iter().zip(offline.iter()) {
            assert_eq!(l.0, o.sync_index);
            for (port, idx) in l.1.iter() {
                assert_eq!(idx.map(|i| i as usize), o.slots[port]);
            }
        }
    }

    #[test]
    fn stop_token_interrupts_sleep() {
        let token = StopToken::new();
        let t2 = token.clone();
        let start = Instant::now();
        let h = std::thread::spawn(move || t2.sleep_unless_stopped(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(50));
        token.stop();
        assert!(h.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn average_fps_from_group_times() {
        let times: Vec<f64> = (0..10).map(|i| i as f64 / 30.0).collect();
        let fps = average_fps(&times).unwrap();
        approx::assert_relative_eq!(fps, 30.0, epsilon = 1e-9);
    }
}
