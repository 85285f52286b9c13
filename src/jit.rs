//! Just-in-time downlink queue.
//!
//! Every transmission request is admitted against the current counter value and kept
//! until the dispatcher sees it enter the ready window, a few tens of milliseconds
//! before its target. Admission guarantees that no two stored requests occupy the
//! radio at the same time, and that downlinks never eat into airtime kept for beacons.
//!
//! Entries live in a slab: the index returned by [`JitQueue::peek`] stays valid for
//! the entry it designates until that entry is dequeued or cancelled. Ordering is
//! never stored, it is recomputed from `target - now` because the counter wraps.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::config::JitConfig;
use crate::packet::TxPacket;
use crate::tick::HardwareTick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketClass {
    /// Reply in a device receive window, timestamped by the server.
    DownlinkA,
    /// Ping slot aligned on GPS time.
    DownlinkB,
    /// Sent as soon as the radio is free.
    DownlinkC,
    Beacon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JitEntry {
    pub target_tick: HardwareTick,
    pub packet: TxPacket,
    pub class: PacketClass,
    pub time_on_air_us: u32,
}

impl JitEntry {
    pub fn new(target_tick: HardwareTick, packet: TxPacket, class: PacketClass) -> Self {
        let time_on_air_us = packet.time_on_air_us();
        JitEntry {
            target_tick,
            packet,
            class,
            time_on_air_us,
        }
    }

    pub fn with_time_on_air(mut self, time_on_air_us: u32) -> Self {
        self.time_on_air_us = time_on_air_us;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum JitError {
    #[error("queue is full")]
    Full,
    #[error("too late to schedule")]
    TooLate,
    #[error("too far in the future")]
    TooEarly,
    #[error("collides with a queued packet")]
    CollisionPacket,
    #[error("collides with a queued beacon")]
    CollisionBeacon,
    #[error("frequency not supported by the RF chain")]
    TxFreq,
    #[error("power not supported, clamped")]
    TxPower,
    #[error("modulation parameters not supported by the radio")]
    TxParams,
    #[error("no valid GPS time reference")]
    GpsUnlocked,
    #[error("no entry at this index")]
    Empty,
}

impl JitError {
    /// Error string reported back to the network server in the TX acknowledgement.
    pub fn ack_code(&self) -> &'static str {
        match self {
            JitError::Full | JitError::CollisionPacket => "COLLISION_PACKET",
            JitError::TooLate => "TOO_LATE",
            JitError::TooEarly => "TOO_EARLY",
            JitError::CollisionBeacon => "COLLISION_BEACON",
            JitError::TxFreq | JitError::TxParams => "TX_FREQ",
            JitError::TxPower => "TX_POWER",
            JitError::GpsUnlocked => "GPS_UNLOCKED",
            JitError::Empty => "NONE",
        }
    }
}

struct Node {
    id: EntryId,
    entry: JitEntry,
}

struct QueueState {
    slots: Vec<Option<Node>>,
    len: usize,
    beacons: usize,
    next_id: u64,
    missed: u64,
}

/// Radio occupancy of one request, in microseconds relative to `now`.
#[derive(Debug, Clone, Copy)]
struct Window {
    start: i64,
    end: i64,
}

impl Window {
    fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }
}

pub struct JitQueue {
    config: JitConfig,
    state: Mutex<QueueState>,
}

impl JitQueue {
    pub fn new(config: JitConfig) -> Self {
        let mut slots = Vec::with_capacity(config.capacity);
        slots.resize_with(config.capacity, || None);
        JitQueue {
            config,
            state: Mutex::new(QueueState {
                slots,
                len: 0,
                beacons: 0,
                next_id: 1,
                missed: 0,
            }),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn enqueue(&self, entry: JitEntry, now: HardwareTick) -> Result<EntryId, JitError> {
        let mut st = self.lock();
        self.admit(&mut st, entry, now)
    }

    /// Class C request: takes the first gap at least the minimum lead after `now`.
    pub fn enqueue_immediate(&self, packet: TxPacket, now: HardwareTick) -> Result<(EntryId, HardwareTick), JitError> {
        let mut st = self.lock();

        let probe = JitEntry::new(now, packet, PacketClass::DownlinkC);
        let (pre, post) = self.padding(&probe);

        let mut busy: Vec<Window> = st
            .slots
            .iter()
            .flatten()
            .map(|n| self.window(&n.entry, now))
            .collect();
        busy.sort_by_key(|w| w.start);

        let mut target = self.config.min_lead_us() as i64;
        for w in &busy {
            let candidate = Window {
                start: target - pre,
                end: target + post,
            };
            if candidate.overlaps(w) {
                target = w.end + pre;
            }
        }

        let target_tick = now.offset_us(target);
        let entry = JitEntry { target_tick, ..probe };
        let id = self.admit(&mut st, entry, now)?;
        Ok((id, target_tick))
    }

    /// Slot index of the earliest entry due for transmission, if any.
    ///
    /// Entries already later than the late tolerance are removed and counted as missed.
    pub fn peek(&self, now: HardwareTick) -> Option<usize> {
        let mut st = self.lock();
        let late_tolerance = self.config.late_tolerance_us as i64;

        let mut best: Option<(usize, i64)> = None;
        for index in 0..st.slots.len() {
            let Some(node) = &st.slots[index] else { continue };
            let delta = node.entry.target_tick.since(now) as i64;

            if delta < -late_tolerance {
                warn!(
                    "[jit] dropping missed {:?} {} (target {} passed {} us ago)",
                    node.entry.class, node.id, node.entry.target_tick, -delta
                );
                self.remove(&mut st, index);
                st.missed += 1;
                continue;
            }
            if best.map_or(true, |(_, d)| delta < d) {
                best = Some((index, delta));
            }
        }

        match best {
            Some((index, delta)) if delta < self.config.jit_lead_us as i64 => Some(index),
            _ => None,
        }
    }

    pub fn dequeue(&self, index: usize) -> Result<JitEntry, JitError> {
        let mut st = self.lock();
        match self.remove(&mut st, index) {
            Some(node) => {
                debug!("[jit] dequeued {:?} {} at slot {}", node.entry.class, node.id, index);
                Ok(node.entry)
            }
            None => Err(JitError::Empty),
        }
    }

    pub fn cancel(&self, id: EntryId) -> Option<JitEntry> {
        let mut st = self.lock();
        let index = st
            .slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |n| n.id == id))?;
        self.remove(&mut st, index).map(|node| node.entry)
    }

    pub fn count_of(&self, class: PacketClass) -> usize {
        let st = self.lock();
        if class == PacketClass::Beacon {
            return st.beacons;
        }
        st.slots.iter().flatten().filter(|n| n.entry.class == class).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Entries dropped at peek time because their target had passed.
    pub fn missed_total(&self) -> u64 {
        self.lock().missed
    }

    /// Copy of the queued entries in transmission order as seen from `now`.
    pub fn pending(&self, now: HardwareTick) -> Vec<(EntryId, JitEntry)> {
        let st = self.lock();
        let mut entries: Vec<(EntryId, JitEntry)> =
            st.slots.iter().flatten().map(|n| (n.id, n.entry.clone())).collect();
        entries.sort_by_key(|(_, e)| e.target_tick.since(now));
        entries
    }

    fn admit(&self, st: &mut QueueState, entry: JitEntry, now: HardwareTick) -> Result<EntryId, JitError> {
        let is_beacon = entry.class == PacketClass::Beacon;
        // No airtime means the modem cannot send these parameters at all.
        if entry.time_on_air_us == 0 {
            return Err(JitError::TxParams);
        }
        if st.len >= self.config.capacity {
            return Err(JitError::Full);
        }
        if is_beacon && st.beacons >= self.config.beacon_slots {
            return Err(JitError::Full);
        }
        // Downlinks may not take the slots kept for beacons.
        if !is_beacon && st.len - st.beacons >= self.config.capacity.saturating_sub(self.config.beacon_slots) {
            return Err(JitError::Full);
        }

        let delta = entry.target_tick.since(now) as i64;
        if delta < self.config.min_lead_us() as i64 {
            return Err(JitError::TooLate);
        }
        if delta > self.config.max_advance_us as i64 {
            return Err(JitError::TooEarly);
        }

        let window = self.window(&entry, now);
        let mut packet_collision = false;
        for node in st.slots.iter().flatten() {
            if window.overlaps(&self.window(&node.entry, now)) {
                if node.entry.class == PacketClass::Beacon {
                    return Err(JitError::CollisionBeacon);
                }
                packet_collision = true;
            }
        }
        if packet_collision {
            return Err(JitError::CollisionPacket);
        }

        let Some(index) = st.slots.iter().position(Option::is_none) else {
            return Err(JitError::Full);
        };
        let id = EntryId(st.next_id);
        st.next_id += 1;
        debug!(
            "[jit] queued {:?} {} at slot {} for tick {} ({} us ahead, {} us on air)",
            entry.class, id, index, entry.target_tick, delta, entry.time_on_air_us
        );
        if is_beacon {
            st.beacons += 1;
        }
        st.len += 1;
        st.slots[index] = Some(Node { id, entry });
        Ok(id)
    }

    fn remove(&self, st: &mut QueueState, index: usize) -> Option<Node> {
        let node = st.slots.get_mut(index)?.take()?;
        st.len -= 1;
        if node.entry.class == PacketClass::Beacon {
            st.beacons -= 1;
        }
        Some(node)
    }

    /// Microseconds kept free before and after the target.
    fn padding(&self, entry: &JitEntry) -> (i64, i64) {
        let cfg = &self.config;
        let (pre, airtime) = if entry.class == PacketClass::Beacon {
            (
                cfg.tx_start_delay_us as i64 + cfg.beacon_guard_us as i64,
                entry.time_on_air_us.max(cfg.beacon_reserved_us) as i64,
            )
        } else {
            (cfg.tx_start_delay_us as i64, entry.time_on_air_us as i64)
        };
        (pre, airtime + cfg.tx_margin_us as i64)
    }

    fn window(&self, entry: &JitEntry, now: HardwareTick) -> Window {
        let target = entry.target_tick.since(now) as i64;
        let (pre, post) = self.padding(entry);
        Window {
            start: target - pre,
            end: target + post,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// No guard margins: windows are exactly `[target, target + time_on_air)`.
    fn bare_config() -> JitConfig {
        JitConfig {
            capacity: 8,
            beacon_slots: 2,
            tx_start_delay_us: 0,
            tx_margin_us: 0,
            jit_lead_us: 50,
            late_tolerance_us: 10,
            max_advance_us: 10_000_000,
            beacon_guard_us: 0,
            beacon_reserved_us: 0,
        }
    }

    fn packet(tag: u8) -> TxPacket {
        TxPacket::lora_downlink(868_100_000, 7, 125_000, vec![tag; 4])
    }

    fn entry(target: u32, airtime: u32, class: PacketClass) -> JitEntry {
        JitEntry::new(HardwareTick(target), packet(target as u8), class).with_time_on_air(airtime)
    }

    #[test]
    fn test_end_to_end_class_a() {
        let _ = env_logger::builder().is_test(true).try_init();
        let queue = JitQueue::new(JitConfig::default());
        let now = HardwareTick(10_000_000);
        let payload = vec![0x60, 0x01, 0x02, 0x03, 0x04];
        let pkt = TxPacket::lora_downlink(868_100_000, 9, 125_000, payload.clone());
        let target = now.add_us(2_000_000);

        queue.enqueue(JitEntry::new(target, pkt, PacketClass::DownlinkA), now).unwrap();

        assert_eq!(queue.peek(now), None);
        let index = queue.peek(target).unwrap();
        let out = queue.dequeue(index).unwrap();
        assert_eq!(out.packet.payload, payload);
        assert_eq!(out.target_tick, target);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_collision_packet_and_adjacency() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);

        queue.enqueue(entry(1000, 100, PacketClass::DownlinkA), now).unwrap();
        assert_eq!(
            queue.enqueue(entry(1050, 100, PacketClass::DownlinkA), now),
            Err(JitError::CollisionPacket)
        );
        assert!(queue.enqueue(entry(1100, 100, PacketClass::DownlinkA), now).is_ok());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_beacon_collision_takes_precedence() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);

        queue.enqueue(entry(1000, 100, PacketClass::DownlinkA), now).unwrap();
        queue.enqueue(entry(1100, 100, PacketClass::Beacon), now).unwrap();

        // Overlaps both the packet and the beacon.
        assert_eq!(
            queue.enqueue(entry(1050, 100, PacketClass::DownlinkB), now),
            Err(JitError::CollisionBeacon)
        );
    }

    #[test]
    fn test_default_guards_protect_beacon() {
        let queue = JitQueue::new(JitConfig::default());
        let now = HardwareTick(0);
        let beacon_at = 60_000_000;
        queue.enqueue(entry(beacon_at, 150_000, PacketClass::Beacon), now).unwrap();

        // Ends 1 s before the beacon, inside the 3 s guard.
        assert_eq!(
            queue.enqueue(entry(beacon_at - 1_500_000, 500_000, PacketClass::DownlinkA), now),
            Err(JitError::CollisionBeacon)
        );
        // Starts 2 s after the beacon, inside its 2.12 s reservation.
        assert_eq!(
            queue.enqueue(entry(beacon_at + 2_000_000, 10_000, PacketClass::DownlinkA), now),
            Err(JitError::CollisionBeacon)
        );
        assert!(queue
            .enqueue(entry(beacon_at + 2_200_000, 10_000, PacketClass::DownlinkA), now)
            .is_ok());
    }

    #[test]
    fn test_too_late_and_too_early() {
        let queue = JitQueue::new(JitConfig::default());
        let now = HardwareTick(5_000_000);

        let late = JitEntry::new(now.add_us(32_499), packet(1), PacketClass::DownlinkA);
        assert_eq!(queue.enqueue(late, now), Err(JitError::TooLate));

        let past = JitEntry::new(HardwareTick(4_000_000), packet(1), PacketClass::DownlinkA);
        assert_eq!(queue.enqueue(past, now), Err(JitError::TooLate));

        let early = JitEntry::new(now.add_us(512_000_001), packet(1), PacketClass::DownlinkA);
        assert_eq!(queue.enqueue(early, now), Err(JitError::TooEarly));

        let edge = JitEntry::new(now.add_us(32_500), packet(1), PacketClass::DownlinkA);
        assert!(queue.enqueue(edge, now).is_ok());
    }

    #[test]
    fn test_full_and_beacon_slots_reserved() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);

        for i in 0..6 {
            queue.enqueue(entry(1_000 + i * 1_000, 100, PacketClass::DownlinkA), now).unwrap();
        }
        // Two slots left, both kept for beacons.
        assert_eq!(
            queue.enqueue(entry(50_000, 100, PacketClass::DownlinkA), now),
            Err(JitError::Full)
        );
        queue.enqueue(entry(60_000, 100, PacketClass::Beacon), now).unwrap();
        queue.enqueue(entry(70_000, 100, PacketClass::Beacon), now).unwrap();
        assert_eq!(queue.count_of(PacketClass::Beacon), 2);
        assert_eq!(
            queue.enqueue(entry(80_000, 100, PacketClass::Beacon), now),
            Err(JitError::Full)
        );
        assert_eq!(queue.len(), queue.capacity());
    }

    #[test]
    fn test_beacon_count_limit() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);
        queue.enqueue(entry(1_000, 100, PacketClass::Beacon), now).unwrap();
        queue.enqueue(entry(2_000, 100, PacketClass::Beacon), now).unwrap();
        assert_eq!(
            queue.enqueue(entry(3_000, 100, PacketClass::Beacon), now),
            Err(JitError::Full)
        );
        assert!(queue.enqueue(entry(3_000, 100, PacketClass::DownlinkC), now).is_ok());
    }

    #[test]
    fn test_peek_orders_across_wrap() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0xFFFF_FF00);

        queue.enqueue(entry(0x0000_0100, 100, PacketClass::DownlinkA), now).unwrap();
        queue.enqueue(entry(0xFFFF_FFA0, 50, PacketClass::DownlinkA), now).unwrap();

        let first = queue.peek(HardwareTick(0xFFFF_FF90)).unwrap();
        assert_eq!(queue.dequeue(first).unwrap().target_tick, HardwareTick(0xFFFF_FFA0));

        assert_eq!(queue.peek(HardwareTick(0x0000_0010)), None);
        let second = queue.peek(HardwareTick(0x0000_0100)).unwrap();
        assert_eq!(queue.dequeue(second).unwrap().target_tick, HardwareTick(0x0000_0100));
    }

    #[test]
    fn test_missed_entries_dropped_at_peek() {
        let _ = env_logger::builder().is_test(true).try_init();
        let queue = JitQueue::new(bare_config());
        queue.enqueue(entry(1_000, 100, PacketClass::DownlinkA), HardwareTick(0)).unwrap();
        queue.enqueue(entry(5_000, 100, PacketClass::DownlinkA), HardwareTick(0)).unwrap();

        // 1000 is 11 us late with a 10 us tolerance; 5000 is not due yet.
        assert_eq!(queue.peek(HardwareTick(1_011)), None);
        assert_eq!(queue.missed_total(), 1);
        assert_eq!(queue.len(), 1);

        // Still within tolerance.
        let index = queue.peek(HardwareTick(5_010)).unwrap();
        assert!(queue.dequeue(index).is_ok());
    }

    #[test]
    fn test_dequeue_vacant_slot() {
        let queue = JitQueue::new(bare_config());
        assert_eq!(queue.dequeue(0), Err(JitError::Empty));
        assert_eq!(queue.dequeue(100), Err(JitError::Empty));
    }

    #[test]
    fn test_index_stable_under_concurrent_enqueue() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);
        queue.enqueue(entry(1_000, 100, PacketClass::DownlinkA), now).unwrap();

        let index = queue.peek(HardwareTick(990)).unwrap();
        // A producer inserts an earlier entry between peek and dequeue.
        queue.enqueue(entry(200, 100, PacketClass::DownlinkA), HardwareTick(100)).unwrap();

        assert_eq!(queue.dequeue(index).unwrap().target_tick, HardwareTick(1_000));
    }

    #[test]
    fn test_cancel_by_id() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);
        let keep = queue.enqueue(entry(1_000, 100, PacketClass::DownlinkB), now).unwrap();
        let gone = queue.enqueue(entry(2_000, 100, PacketClass::DownlinkB), now).unwrap();
        assert_ne!(keep, gone);

        assert_eq!(queue.cancel(gone).unwrap().target_tick, HardwareTick(2_000));
        assert!(queue.cancel(gone).is_none());
        assert_eq!(queue.count_of(PacketClass::DownlinkB), 1);
        assert_eq!(queue.pending(now)[0].0, keep);
    }

    #[test]
    fn test_immediate_fills_first_gap() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);
        // The 50 us minimum lead lands inside the first entry.
        queue.enqueue(entry(60, 1_000, PacketClass::DownlinkA), now).unwrap();
        queue.enqueue(entry(100_000, 1_000, PacketClass::DownlinkA), now).unwrap();

        let (_, target) = queue.enqueue_immediate(packet(9), now).unwrap();
        assert_eq!(target, HardwareTick(1_060));

        let pending = queue.pending(now);
        assert_eq!(pending[1].1.class, PacketClass::DownlinkC);
        assert_eq!(pending[1].1.target_tick, HardwareTick(1_060));
    }

    #[test]
    fn test_unsupported_modulation_rejected() {
        let queue = JitQueue::new(bare_config());
        let now = HardwareTick(0);

        let sf13 = TxPacket::lora_downlink(868_100_000, 13, 125_000, vec![0; 200]);
        assert_eq!(sf13.time_on_air_us(), 0);
        let oversized = JitEntry::new(HardwareTick(2_000), sf13.clone(), PacketClass::DownlinkA);
        assert_eq!(queue.enqueue(oversized, now), Err(JitError::TxParams));
        assert_eq!(queue.enqueue_immediate(sf13, now), Err(JitError::TxParams));

        // Two zero-width windows at the same tick would otherwise both fit.
        assert_eq!(
            queue.enqueue(entry(1_000, 0, PacketClass::DownlinkA), now),
            Err(JitError::TxParams)
        );
        assert!(queue.enqueue(entry(1_000, 100, PacketClass::DownlinkA), now).is_ok());
        assert_eq!(
            queue.enqueue(entry(1_000, 100, PacketClass::DownlinkB), now),
            Err(JitError::CollisionPacket)
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_more_beacon_slots_than_capacity() {
        let mut config = bare_config();
        config.capacity = 2;
        config.beacon_slots = 3;
        let queue = JitQueue::new(config);
        let now = HardwareTick(0);

        assert_eq!(
            queue.enqueue(entry(1_000, 100, PacketClass::DownlinkA), now),
            Err(JitError::Full)
        );
        queue.enqueue(entry(2_000, 100, PacketClass::Beacon), now).unwrap();
        queue.enqueue(entry(3_000, 100, PacketClass::Beacon), now).unwrap();
        assert_eq!(
            queue.enqueue(entry(4_000, 100, PacketClass::Beacon), now),
            Err(JitError::Full)
        );
    }

    #[test]
    fn test_ack_codes() {
        assert_eq!(JitError::Full.ack_code(), "COLLISION_PACKET");
        assert_eq!(JitError::CollisionPacket.ack_code(), "COLLISION_PACKET");
        assert_eq!(JitError::CollisionBeacon.ack_code(), "COLLISION_BEACON");
        assert_eq!(JitError::TooLate.ack_code(), "TOO_LATE");
        assert_eq!(JitError::TooEarly.ack_code(), "TOO_EARLY");
        assert_eq!(JitError::TxFreq.ack_code(), "TX_FREQ");
        assert_eq!(JitError::TxParams.ack_code(), "TX_FREQ");
        assert_eq!(JitError::TxPower.ack_code(), "TX_POWER");
        assert_eq!(JitError::GpsUnlocked.ack_code(), "GPS_UNLOCKED");
    }
}
