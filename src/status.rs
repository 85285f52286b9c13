use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::jit::JitError;

pub type SharedStats = Arc<RwLock<DownlinkStats>>;

/// Downlink counters shared between the producer, beacon and dispatcher threads.
///
/// Logged periodically and optionally dumped as JSON for external monitoring.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DownlinkStats {
    // ========================================================================
    // Transmissions
    // ========================================================================
    /// Downlink requests received from the protocol layer
    pub tx_requested: u64,

    /// Packets handed to the concentrator
    pub tx_ok: u64,

    /// Packets dequeued but not sent (radio busy emitting, HAL error)
    pub tx_fail: u64,

    /// Packets whose target passed before the dispatcher reached them
    pub tx_dropped_missed: u64,

    // ========================================================================
    // Admission rejections (by ack code)
    // ========================================================================
    pub rejected_collision_packet: u64,
    pub rejected_collision_beacon: u64,
    pub rejected_too_late: u64,
    pub rejected_too_early: u64,
    /// Frequency or modulation the radio cannot send
    pub rejected_tx_freq: u64,
    pub rejected_gps_unlocked: u64,

    /// Accepted requests whose power was lowered to a supported value
    pub power_clamped: u64,

    // ========================================================================
    // Beacons
    // ========================================================================
    pub beacon_queued: u64,
    pub beacon_sent: u64,

    /// Enqueue failures other than a collision with another beacon
    pub beacon_rejected: u64,

    // ========================================================================
    // Timing
    // ========================================================================
    pub time_ref_valid: bool,
    pub xtal_valid: bool,
    pub xtal_factor: f64,
    pub queue_len: usize,

    /// Unix timestamp of the last snapshot
    pub updated_ts: u64,
}

impl Default for DownlinkStats {
    fn default() -> Self {
        DownlinkStats {
            tx_requested: 0,
            tx_ok: 0,
            tx_fail: 0,
            tx_dropped_missed: 0,
            rejected_collision_packet: 0,
            rejected_collision_beacon: 0,
            rejected_too_late: 0,
            rejected_too_early: 0,
            rejected_tx_freq: 0,
            rejected_gps_unlocked: 0,
            power_clamped: 0,
            beacon_queued: 0,
            beacon_sent: 0,
            beacon_rejected: 0,
            time_ref_valid: false,
            xtal_valid: false,
            xtal_factor: 1.0,
            queue_len: 0,
            updated_ts: 0,
        }
    }
}

impl DownlinkStats {
    pub fn shared() -> SharedStats {
        Arc::new(RwLock::new(DownlinkStats::default()))
    }

    pub fn record_rejection(&mut self, error: JitError) {
        match error {
            JitError::Full | JitError::CollisionPacket => self.rejected_collision_packet += 1,
            JitError::CollisionBeacon => self.rejected_collision_beacon += 1,
            JitError::TooLate => self.rejected_too_late += 1,
            JitError::TooEarly => self.rejected_too_early += 1,
            JitError::TxFreq | JitError::TxParams => self.rejected_tx_freq += 1,
            JitError::GpsUnlocked => self.rejected_gps_unlocked += 1,
            JitError::TxPower => self.power_clamped += 1,
            JitError::Empty => {}
        }
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_collision_packet
            + self.rejected_collision_beacon
            + self.rejected_too_late
            + self.rejected_too_early
            + self.rejected_tx_freq
            + self.rejected_gps_unlocked
    }

    pub fn touch(&mut self) {
        self.updated_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
    }

    pub fn log_summary(&self) {
        info!(
            "[stats] tx req={} ok={} fail={} missed={} rejected={} (coll_pkt={} coll_bcn={} late={} early={} freq={} gps={}) clamped={}",
            self.tx_requested,
            self.tx_ok,
            self.tx_fail,
            self.tx_dropped_missed,
            self.rejected_total(),
            self.rejected_collision_packet,
            self.rejected_collision_beacon,
            self.rejected_too_late,
            self.rejected_too_early,
            self.rejected_tx_freq,
            self.rejected_gps_unlocked,
            self.power_clamped
        );
        info!(
            "[stats] beacons queued={} sent={} rejected={} | time ref {} | xtal {} ({:.9}) | queue {}",
            self.beacon_queued,
            self.beacon_sent,
            self.beacon_rejected,
            if self.time_ref_valid { "valid" } else { "invalid" },
            if self.xtal_valid { "valid" } else { "invalid" },
            self.xtal_factor,
            self.queue_len
        );
    }

    /// Writes the snapshot as JSON, replacing the file atomically.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("failed to move status file to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downlink_stats_default() {
        let stats = DownlinkStats::default();
        assert_eq!(stats.tx_ok, 0);
        assert_eq!(stats.xtal_factor, 1.0);
        assert!(!stats.time_ref_valid);
        assert_eq!(stats.rejected_total(), 0);
    }

    #[test]
    fn test_record_rejection_by_ack_code() {
        let mut stats = DownlinkStats::default();
        stats.record_rejection(JitError::Full);
        stats.record_rejection(JitError::CollisionPacket);
        stats.record_rejection(JitError::CollisionBeacon);
        stats.record_rejection(JitError::TooLate);
        stats.record_rejection(JitError::TxPower);
        stats.record_rejection(JitError::Empty);
        stats.record_rejection(JitError::TxParams);

        assert_eq!(stats.rejected_tx_freq, 1);
        assert_eq!(stats.rejected_collision_packet, 2);
        assert_eq!(stats.rejected_collision_beacon, 1);
        assert_eq!(stats.rejected_too_late, 1);
        assert_eq!(stats.power_clamped, 1);
        assert_eq!(stats.rejected_total(), 5);
    }

    #[test]
    fn test_write_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downlink.json");

        let mut stats = DownlinkStats::default();
        stats.beacon_sent = 7;
        stats.xtal_factor = 0.999_998;
        stats.time_ref_valid = true;
        stats.write_json(&path).unwrap();

        let restored: DownlinkStats = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(restored, stats);
        assert!(!path.with_extension("tmp").exists());
    }
}
