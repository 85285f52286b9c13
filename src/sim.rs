//! Simulated concentrator and GPS receiver.
//!
//! Both run off the same [`MonotonicClock`], which plays the role of true time. The
//! concentrator counter runs `drift_ppm` fast (or slow) relative to it, and the GPS
//! reports one fix per whole second of it, like a PPS-disciplined receiver would.

use anyhow::{anyhow, Result};
use log::debug;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::clock::MonotonicClock;
use crate::packet::{TxMode, TxPacket};
use crate::tick::HardwareTick;
use crate::timebase::{Timespec, GPS_UNIX_EPOCH_OFFSET};
use crate::traits::{Concentrator, GpsFix, GpsSource, TxStatus};

/// GPS-UTC offset applied to the simulated UTC time.
pub const LEAP_SECONDS: i64 = 18;

#[derive(Debug, Clone, PartialEq)]
pub struct SentPacket {
    pub packet: TxPacket,
    pub count_us: HardwareTick,
    /// Counter value when `send` was called.
    pub loaded_at: HardwareTick,
}

pub struct SimConcentrator {
    clock: Arc<dyn MonotonicClock>,
    drift_ppm: f64,
    rf_chains: u8,
    sent: Vec<SentPacket>,
    // start tick and airtime of the last loaded packet
    last_tx: Option<(HardwareTick, u32)>,
}

impl SimConcentrator {
    pub fn new(clock: Arc<dyn MonotonicClock>, drift_ppm: f64) -> Self {
        SimConcentrator {
            clock,
            drift_ppm,
            rf_chains: 1,
            sent: Vec::new(),
            last_tx: None,
        }
    }

    /// Counter value at `true_time`.
    pub fn tick_at(&self, true_time: Duration) -> HardwareTick {
        let us = true_time.as_secs_f64() * 1e6 * (1.0 + self.drift_ppm * 1e-6);
        HardwareTick(us.round() as u64 as u32)
    }

    pub fn sent(&self) -> &[SentPacket] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<SentPacket> {
        std::mem::take(&mut self.sent)
    }

    fn check_chain(&self, rf_chain: u8) -> Result<()> {
        if rf_chain >= self.rf_chains {
            return Err(anyhow!("invalid RF chain {}", rf_chain));
        }
        Ok(())
    }
}

impl Concentrator for SimConcentrator {
    fn instant_count(&mut self) -> Result<HardwareTick> {
        Ok(self.tick_at(self.clock.now()))
    }

    fn trigger_count(&mut self) -> Result<HardwareTick> {
        let pps = Duration::from_secs(self.clock.now().as_secs());
        Ok(self.tick_at(pps))
    }

    fn tx_status(&mut self, rf_chain: u8) -> Result<TxStatus> {
        self.check_chain(rf_chain)?;
        let now = self.tick_at(self.clock.now());
        let status = match self.last_tx {
            Some((start, _)) if now.since(start) < 0 => TxStatus::Scheduled,
            Some((start, airtime)) if now.elapsed_since(start) < airtime => TxStatus::Emitting,
            _ => TxStatus::Free,
        };
        Ok(status)
    }

    fn send(&mut self, packet: &TxPacket, count_us: HardwareTick) -> Result<()> {
        self.check_chain(packet.rf_chain)?;
        let loaded_at = self.tick_at(self.clock.now());
        let start = match packet.tx_mode {
            TxMode::Immediate => loaded_at,
            TxMode::Timestamped | TxMode::OnGps => count_us,
        };
        self.last_tx = Some((start, packet.time_on_air_us()));
        debug!(
            "[sim] loaded {} bytes at {} Hz for tick {} (now {})",
            packet.size(),
            packet.freq_hz,
            count_us,
            loaded_at
        );
        self.sent.push(SentPacket {
            packet: packet.clone(),
            count_us,
            loaded_at,
        });
        Ok(())
    }
}

pub struct SimGps {
    clock: Arc<dyn MonotonicClock>,
    /// GPS time at clock origin.
    gps_start: i64,
    last_pps: Option<u64>,
    blocking: bool,
}

impl SimGps {
    /// A blocking receiver sleeps until the next PPS; a non-blocking one returns `None`
    /// when no new second has started since the previous fix.
    pub fn new(clock: Arc<dyn MonotonicClock>, gps_start: i64, blocking: bool) -> Self {
        SimGps {
            clock,
            gps_start,
            last_pps: None,
            blocking,
        }
    }

    pub fn fix_for(&self, pps_sec: u64) -> GpsFix {
        let gps = Timespec::from_secs(self.gps_start + pps_sec as i64);
        GpsFix {
            utc: Timespec::from_secs(gps.sec + GPS_UNIX_EPOCH_OFFSET - LEAP_SECONDS),
            gps,
        }
    }
}

impl GpsSource for SimGps {
    fn next_fix(&mut self) -> Result<Option<GpsFix>> {
        loop {
            let now = self.clock.now();
            let sec = now.as_secs();
            if self.last_pps != Some(sec) {
                self.last_pps = Some(sec);
                return Ok(Some(self.fix_for(sec)));
            }
            if !self.blocking {
                return Ok(None);
            }
            // Wake shortly after the edge, as the time message follows the PPS.
            let wake = Duration::from_secs(sec + 1) + Duration::from_millis(50);
            thread::sleep(wake.saturating_sub(now));
        }
    }
}
