use anyhow::Result;

use crate::packet::TxPacket;
use crate::tick::HardwareTick;
use crate::timebase::Timespec;

/// State of one RF chain's transmit path as reported by the concentrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Free,
    /// A packet has been loaded and waits for its trigger.
    Scheduled,
    Emitting,
    Off,
}

#[cfg_attr(test, mockall::automock)]
pub trait Concentrator {
    /// Free-running counter value right now.
    fn instant_count(&mut self) -> Result<HardwareTick>;

    /// Counter value latched on the last PPS edge.
    fn trigger_count(&mut self) -> Result<HardwareTick>;

    fn tx_status(&mut self, rf_chain: u8) -> Result<TxStatus>;

    /// Loads a packet into the radio. `count_us` is the transmit instant for
    /// timestamped packets and is ignored otherwise.
    fn send(&mut self, packet: &TxPacket, count_us: HardwareTick) -> Result<()>;
}

/// One decoded GPS time message, matching the last PPS edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsFix {
    pub utc: Timespec,
    pub gps: Timespec,
}

#[cfg_attr(test, mockall::automock)]
pub trait GpsSource {
    /// Blocks until the next time message. `Ok(None)` when the receiver produced
    /// nothing usable (no fix, unrecognised sentence, timeout).
    fn next_fix(&mut self) -> Result<Option<GpsFix>>;
}
