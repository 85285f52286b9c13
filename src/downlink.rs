//! Admission of downlink requests coming from the network server.
//!
//! The protocol layer hands over a packet and how it should be timed; this module
//! resolves the target tick, checks the radio limits and enqueues. The outcome carries
//! the acknowledgement code that goes back to the server.

use log::{info, warn};
use std::sync::{Arc, PoisonError};

use crate::config::{RfChainLimits, TxConfig};
use crate::jit::{EntryId, JitEntry, JitError, JitQueue, PacketClass};
use crate::packet::{TxMode, TxPacket};
use crate::status::SharedStats;
use crate::tick::HardwareTick;
use crate::timebase::{TimeBase, Timespec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkTiming {
    /// Raw concentrator counter value chosen by the server (class A).
    Timestamp(HardwareTick),
    /// Absolute GPS time (class B).
    GpsTime(Timespec),
    /// As soon as possible (class C).
    Immediate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkRequest {
    pub timing: DownlinkTiming,
    pub packet: TxPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub id: EntryId,
    pub class: PacketClass,
    pub target_tick: HardwareTick,
    /// Power actually used when the requested one was not in the LUT.
    pub clamped_power: Option<i8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkOutcome {
    Queued(Accepted),
    Rejected(JitError),
}

impl DownlinkOutcome {
    /// `None` for a clean acceptance.
    pub fn ack_code(&self) -> Option<&'static str> {
        match self {
            DownlinkOutcome::Queued(a) if a.clamped_power.is_some() => Some(JitError::TxPower.ack_code()),
            DownlinkOutcome::Queued(_) => None,
            DownlinkOutcome::Rejected(e) => Some(e.ack_code()),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, DownlinkOutcome::Queued(_))
    }
}

/// Per-RF-chain frequency range and supported powers.
#[derive(Debug, Clone)]
pub struct TxLimits {
    chains: Vec<RfChainLimits>,
}

impl TxLimits {
    pub fn new(chains: Vec<RfChainLimits>) -> Self {
        TxLimits { chains }
    }

    pub fn from_config(config: &TxConfig) -> Self {
        Self::new(config.rf_chains.clone())
    }

    pub fn check_frequency(&self, rf_chain: u8, freq_hz: u32) -> Result<(), JitError> {
        match self.chains.get(rf_chain as usize) {
            Some(c) if (c.freq_min_hz..=c.freq_max_hz).contains(&freq_hz) => Ok(()),
            _ => Err(JitError::TxFreq),
        }
    }

    /// Highest supported power not above `requested`, or the lowest one if all are above.
    pub fn clamp_power(&self, rf_chain: u8, requested: i8) -> i8 {
        let Some(chain) = self.chains.get(rf_chain as usize) else {
            return requested;
        };
        chain
            .power_lut
            .iter()
            .copied()
            .filter(|&p| p <= requested)
            .max()
            .or_else(|| chain.power_lut.iter().copied().min())
            .unwrap_or(requested)
    }
}

pub struct DownlinkAdmission {
    queue: Arc<JitQueue>,
    timebase: Arc<TimeBase>,
    limits: TxLimits,
    stats: SharedStats,
}

impl DownlinkAdmission {
    pub fn new(queue: Arc<JitQueue>, timebase: Arc<TimeBase>, limits: TxLimits, stats: SharedStats) -> Self {
        DownlinkAdmission {
            queue,
            timebase,
            limits,
            stats,
        }
    }

    pub fn submit(&self, request: DownlinkRequest, now: HardwareTick) -> DownlinkOutcome {
        self.stats.write().unwrap_or_else(PoisonError::into_inner).tx_requested += 1;

        let outcome = match self.admit(request, now) {
            Ok(accepted) => DownlinkOutcome::Queued(accepted),
            Err(e) => DownlinkOutcome::Rejected(e),
        };

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        match &outcome {
            DownlinkOutcome::Queued(a) => {
                if a.clamped_power.is_some() {
                    stats.record_rejection(JitError::TxPower);
                }
            }
            DownlinkOutcome::Rejected(e) => stats.record_rejection(*e),
        }
        outcome
    }

    fn admit(&self, request: DownlinkRequest, now: HardwareTick) -> Result<Accepted, JitError> {
        let DownlinkRequest { timing, mut packet } = request;

        if let Err(e) = self.limits.check_frequency(packet.rf_chain, packet.freq_hz) {
            warn!(
                "[downlink] {} Hz not supported on RF chain {}, rejected",
                packet.freq_hz, packet.rf_chain
            );
            return Err(e);
        }

        let power = self.limits.clamp_power(packet.rf_chain, packet.rf_power);
        let clamped_power = if power != packet.rf_power {
            warn!(
                "[downlink] {} dBm not supported on RF chain {}, using {} dBm",
                packet.rf_power, packet.rf_chain, power
            );
            packet.rf_power = power;
            Some(power)
        } else {
            None
        };
        packet.tx_mode = TxMode::Timestamped;

        let (id, class, target_tick) = match timing {
            DownlinkTiming::Timestamp(target) => {
                let id = self.enqueue(JitEntry::new(target, packet, PacketClass::DownlinkA), now)?;
                (id, PacketClass::DownlinkA, target)
            }
            DownlinkTiming::GpsTime(gps) => {
                let target = self.timebase.gps_to_tick(gps).map_err(|e| {
                    warn!("[downlink] class B request for GPS {} refused: {}", gps, e);
                    JitError::GpsUnlocked
                })?;
                let id = self.enqueue(JitEntry::new(target, packet, PacketClass::DownlinkB), now)?;
                (id, PacketClass::DownlinkB, target)
            }
            DownlinkTiming::Immediate => {
                let (id, target) = self.queue.enqueue_immediate(packet, now).map_err(|e| {
                    warn!("[downlink] immediate request rejected: {}", e);
                    e
                })?;
                (id, PacketClass::DownlinkC, target)
            }
        };

        info!("[downlink] queued {:?} {} for tick {}", class, id, target_tick);
        Ok(Accepted {
            id,
            class,
            target_tick,
            clamped_power,
        })
    }

    fn enqueue(&self, entry: JitEntry, now: HardwareTick) -> Result<EntryId, JitError> {
        let (class, target) = (entry.class, entry.target_tick);
        self.queue.enqueue(entry, now).map_err(|e| {
            warn!("[downlink] {:?} for tick {} rejected: {}", class, target, e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::JitConfig;
    use crate::status::DownlinkStats;
    use crate::xtal::CrystalTracker;
    use std::time::Duration;

    fn limits() -> TxLimits {
        TxLimits::from_config(&TxConfig::default())
    }

    #[test]
    fn test_power_clamped_to_closest_lower_entry() {
        let l = limits();
        assert_eq!(l.clamp_power(0, 14), 14);
        assert_eq!(l.clamp_power(0, 15), 14);
        assert_eq!(l.clamp_power(0, 30), 27);
        // Below the whole table: lowest entry.
        assert_eq!(l.clamp_power(0, 2), 12);
    }

    #[test]
    fn test_frequency_limits() {
        let l = limits();
        assert!(l.check_frequency(0, 868_100_000).is_ok());
        assert!(l.check_frequency(0, 863_000_000).is_ok());
        assert_eq!(l.check_frequency(0, 915_000_000), Err(JitError::TxFreq));
        assert_eq!(l.check_frequency(1, 868_100_000), Err(JitError::TxFreq));
    }

    struct Fixture {
        timebase: Arc<TimeBase>,
        stats: SharedStats,
        admission: DownlinkAdmission,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1)));
        let timebase = Arc::new(TimeBase::new(
            clock,
            Arc::new(CrystalTracker::default()),
            Duration::from_secs(30),
        ));
        let stats = DownlinkStats::shared();
        let queue = Arc::new(JitQueue::new(JitConfig::default()));
        let admission = DownlinkAdmission::new(queue, timebase.clone(), limits(), stats.clone());
        Fixture {
            timebase,
            stats,
            admission,
        }
    }

    fn request(timing: DownlinkTiming, freq_hz: u32, power: i8) -> DownlinkRequest {
        let mut packet = TxPacket::lora_downlink(freq_hz, 9, 125_000, vec![1, 2, 3]);
        packet.rf_power = power;
        DownlinkRequest { timing, packet }
    }

    #[test]
    fn test_class_a_accepted_with_power_warning() {
        let f = fixture();
        let now = HardwareTick(1_000_000);
        let out = f
            .admission
            .submit(request(DownlinkTiming::Timestamp(HardwareTick(2_000_000)), 868_100_000, 18), now);

        match out {
            DownlinkOutcome::Queued(a) => {
                assert_eq!(a.class, PacketClass::DownlinkA);
                assert_eq!(a.clamped_power, Some(16));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(out.ack_code(), Some("TX_POWER"));

        let stats = f.stats.read().unwrap();
        assert_eq!(stats.tx_requested, 1);
        assert_eq!(stats.power_clamped, 1);
    }

    #[test]
    fn test_rejections_carry_ack_codes() {
        let f = fixture();
        let now = HardwareTick(1_000_000);

        let out = f
            .admission
            .submit(request(DownlinkTiming::Timestamp(HardwareTick(2_000_000)), 915_000_000, 14), now);
        assert_eq!(out.ack_code(), Some("TX_FREQ"));

        let ok = f
            .admission
            .submit(request(DownlinkTiming::Timestamp(HardwareTick(2_000_000)), 868_100_000, 14), now);
        assert!(ok.is_queued());
        assert_eq!(ok.ack_code(), None);

        let out = f
            .admission
            .submit(request(DownlinkTiming::Timestamp(HardwareTick(2_000_000)), 868_300_000, 14), now);
        assert_eq!(out.ack_code(), Some("COLLISION_PACKET"));

        let out = f
            .admission
            .submit(request(DownlinkTiming::Timestamp(HardwareTick(1_010_000)), 868_100_000, 14), now);
        assert_eq!(out.ack_code(), Some("TOO_LATE"));

        let stats = f.stats.read().unwrap();
        assert_eq!(stats.tx_requested, 4);
        assert_eq!(stats.rejected_tx_freq, 1);
        assert_eq!(stats.rejected_collision_packet, 1);
        assert_eq!(stats.rejected_too_late, 1);
    }

    #[test]
    fn test_unsupported_datarate_rejected() {
        let f = fixture();
        let now = HardwareTick(1_000_000);
        let mut req = request(DownlinkTiming::Timestamp(HardwareTick(2_000_000)), 868_100_000, 14);
        req.packet = TxPacket::lora_downlink(868_100_000, 13, 125_000, vec![0; 200]);

        let out = f.admission.submit(req, now);
        assert_eq!(out, DownlinkOutcome::Rejected(JitError::TxParams));
        assert_eq!(out.ack_code(), Some("TX_FREQ"));

        // The slot stays free for a real packet.
        let ok = f
            .admission
            .submit(request(DownlinkTiming::Timestamp(HardwareTick(2_003_000)), 868_100_000, 14), now);
        assert!(ok.is_queued());
        assert_eq!(f.stats.read().unwrap().rejected_tx_freq, 1);
    }

    #[test]
    fn test_class_b_needs_gps() {
        let f = fixture();
        let gps = Timespec::from_secs(1_400_000_000);
        let target = Timespec::from_secs(1_400_000_005);
        let now = HardwareTick(0);

        let out = f.admission.submit(request(DownlinkTiming::GpsTime(target), 868_100_000, 14), now);
        assert_eq!(out, DownlinkOutcome::Rejected(JitError::GpsUnlocked));
        assert_eq!(out.ack_code(), Some("GPS_UNLOCKED"));

        let _ = f.timebase.sync(HardwareTick(0), gps, gps);
        match f.admission.submit(request(DownlinkTiming::GpsTime(target), 868_100_000, 14), now) {
            DownlinkOutcome::Queued(a) => {
                assert_eq!(a.class, PacketClass::DownlinkB);
                assert_eq!(a.target_tick, HardwareTick(5_000_000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_class_c_immediate() {
        let f = fixture();
        let now = HardwareTick(7_000_000);
        match f.admission.submit(request(DownlinkTiming::Immediate, 869_525_000, 14), now) {
            DownlinkOutcome::Queued(a) => {
                assert_eq!(a.class, PacketClass::DownlinkC);
                assert_eq!(a.target_tick, now.add_us(32_500));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
