//! Class B beacon generation.
//!
//! Beacons go out on every GPS second that is a multiple of the beacon period. The
//! scheduler keeps `beacon_slots` of them queued ahead of time so that downlinks are
//! refused, rather than the beacon, when both want the radio.
//!
//! Payload layout (little endian), sizes depending on the spreading factor:
//!
//! ```text
//! | RFU1 | GPS time (4) | CRC1 (2) | info (1) | lat (3) | lon (3) | RFU2 | CRC2 (2) |
//! ```
//!
//! CRC1 covers RFU1 and the time, CRC2 covers the gateway-specific part in between.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::sync::{Arc, PoisonError};

use crate::config::BeaconConfig;
use crate::jit::{JitEntry, JitError, JitQueue, PacketClass};
use crate::packet::{CodeRate, Modulation, TxMode, TxPacket};
use crate::status::SharedStats;
use crate::tick::HardwareTick;
use crate::timebase::{TimeBase, Timespec};

const BEACON_PREAMBLE: u16 = 10;

/// CRC-16/XMODEM (poly 0x1021, init 0, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    const POLY: u16 = 0x1021;
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
        }
    }
    crc
}

/// RFU field sizes around the network-common and gateway-specific parts.
pub fn rfu_sizes(spreading_factor: u8) -> Option<(usize, usize)> {
    match spreading_factor {
        8 => Some((1, 3)),
        9 => Some((2, 0)),
        10 => Some((3, 1)),
        12 => Some((5, 3)),
        _ => None,
    }
}

/// Coordinate as a 24-bit two's complement fraction of `full_scale` degrees.
fn encode_coordinate(degrees: f64, full_scale: f64) -> i32 {
    let raw = (degrees / full_scale * (1 << 23) as f64) as i32;
    raw.clamp(-0x80_0000, 0x7F_FFFF)
}

/// Beacon transmit parameters and the static gateway-specific part of the payload.
#[derive(Debug, Clone)]
pub struct BeaconTemplate {
    packet: TxPacket,
    rfu1: usize,
}

impl BeaconTemplate {
    /// `None` when the datarate has no beacon layout.
    pub fn new(config: &BeaconConfig) -> Option<Self> {
        let (rfu1, rfu2) = rfu_sizes(config.datarate)?;
        let mut payload = vec![0u8; rfu1 + 4 + 2 + 7 + rfu2 + 2];

        let gw = 6 + rfu1;
        payload[gw] = config.infodesc;
        LittleEndian::write_i24(&mut payload[gw + 1..gw + 4], encode_coordinate(config.latitude, 90.0));
        LittleEndian::write_i24(&mut payload[gw + 4..gw + 7], encode_coordinate(config.longitude, 180.0));
        let crc2 = crc16(&payload[gw..gw + 7 + rfu2]);
        let crc2_at = gw + 7 + rfu2;
        LittleEndian::write_u16(&mut payload[crc2_at..crc2_at + 2], crc2);

        let packet = TxPacket {
            freq_hz: config.freq_hz,
            rf_chain: 0,
            rf_power: config.power_dbm,
            tx_mode: TxMode::OnGps,
            modulation: Modulation::Lora {
                spreading_factor: config.datarate,
                bandwidth_hz: config.bandwidth_hz,
                coderate: CodeRate::Cr4_5,
            },
            preamble: BEACON_PREAMBLE,
            invert_pol: false,
            no_crc: true,
            no_header: true,
            payload,
        };
        Some(BeaconTemplate { packet, rfu1 })
    }

    /// The beacon to transmit at `gps_sec` on `freq_hz`.
    pub fn build(&self, gps_sec: i64, freq_hz: u32) -> TxPacket {
        let mut packet = self.packet.clone();
        packet.freq_hz = freq_hz;
        let p = &mut packet.payload;
        let time_end = self.rfu1 + 4;
        LittleEndian::write_u32(&mut p[self.rfu1..time_end], gps_sec as u32);
        let crc1 = crc16(&p[..time_end]);
        LittleEndian::write_u16(&mut p[time_end..time_end + 2], crc1);
        packet
    }
}

/// Channel hopping: `(gps_sec / period) mod freq_nb`.
pub fn beacon_frequency(config: &BeaconConfig, gps_sec: i64) -> u32 {
    if config.freq_nb <= 1 || config.period_s == 0 {
        return config.freq_hz;
    }
    let channel = (gps_sec / config.period_s as i64).rem_euclid(config.freq_nb as i64) as u32;
    config.freq_hz + channel * config.freq_step_hz
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeaconScheduleState {
    pub last_beacon_gps_sec: Option<i64>,
    pub retry_count: u32,
}

pub struct BeaconScheduler {
    config: BeaconConfig,
    template: Option<BeaconTemplate>,
    queue: Arc<JitQueue>,
    timebase: Arc<TimeBase>,
    stats: SharedStats,
    state: BeaconScheduleState,
}

impl BeaconScheduler {
    pub fn new(config: BeaconConfig, queue: Arc<JitQueue>, timebase: Arc<TimeBase>, stats: SharedStats) -> Self {
        let template = BeaconTemplate::new(&config);
        if config.period_s != 0 && template.is_none() {
            warn!("[beacon] SF{} has no beacon layout, beaconing disabled", config.datarate);
        }
        BeaconScheduler {
            config,
            template,
            queue,
            timebase,
            stats,
            state: BeaconScheduleState::default(),
        }
    }

    pub fn state(&self) -> BeaconScheduleState {
        self.state
    }

    /// Tops the queue up to its beacon slot count. Returns the number of beacons queued.
    pub fn poll(&mut self, now: HardwareTick) -> usize {
        let Some(template) = &self.template else { return 0 };
        if self.config.period_s == 0 {
            return 0;
        }
        let period = self.config.period_s as i64;
        let mut deficit = self
            .queue
            .config()
            .beacon_slots
            .saturating_sub(self.queue.count_of(PacketClass::Beacon));
        let mut queued = 0;
        let mut attempts = 0;
        self.state.retry_count = 0;

        while deficit > 0 {
            let Ok(reference) = self.timebase.snapshot() else { break };
            if !self.timebase.tracker().is_valid() {
                break;
            }

            let first_future = reference.gps.sec + period - reference.gps.sec.rem_euclid(period);
            let base = match self.state.last_beacon_gps_sec {
                Some(last) => last + period,
                None => first_future,
            };
            let mut next = base + self.state.retry_count as i64 * period;
            if next < first_future {
                // GPS was lost for a while: skip the slots that already passed.
                self.state.retry_count = ((first_future - base) / period) as u32;
                next = first_future;
            }

            let tick = match self.timebase.gps_to_tick(Timespec::from_secs(next)) {
                Ok(tick) => tick,
                Err(e) => {
                    debug!("[beacon] cannot place beacon at GPS {}: {}", next, e);
                    break;
                }
            };
            let freq_hz = beacon_frequency(&self.config, next);
            let packet = template.build(next, freq_hz);

            match self.queue.enqueue(JitEntry::new(tick, packet, PacketClass::Beacon), now) {
                Ok(id) => {
                    info!(
                        "[beacon] queued {} for GPS {} (tick {}, {} Hz)",
                        id, next, tick, freq_hz
                    );
                    self.state.last_beacon_gps_sec = Some(next);
                    self.state.retry_count = 0;
                    deficit -= 1;
                    queued += 1;
                    self.stats.write().unwrap_or_else(PoisonError::into_inner).beacon_queued += 1;
                }
                Err(e) => {
                    debug!("[beacon] queuing beacon for GPS {} failed: {}", next, e);
                    if e != JitError::CollisionBeacon {
                        self.stats.write().unwrap_or_else(PoisonError::into_inner).beacon_rejected += 1;
                    }
                    if matches!(e, JitError::TooEarly | JitError::Full) {
                        break;
                    }
                    self.state.retry_count += 1;
                    attempts += 1;
                    if attempts >= self.config.max_retries_per_cycle {
                        warn!("[beacon] giving up after {} retries this cycle", attempts);
                        break;
                    }
                }
            }
        }
        queued
    }
}
