use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Seconds in a day; beacon periods must divide it.
const SECONDS_PER_DAY: u32 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub jit: JitConfig,
    pub gps: GpsConfig,
    pub beacon: BeaconConfig,
    pub tx: TxConfig,
    pub dispatcher: DispatcherConfig,
    pub stats_interval_secs: u64,
    pub status_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub capacity: usize,
    pub beacon_slots: usize,     // beacons kept pre-allocated in the queue
    pub tx_start_delay_us: u32,  // radio ramp-up before the first symbol
    pub tx_margin_us: u32,       // packet overlap margin
    pub jit_lead_us: u32,        // how early a packet is handed to the radio
    pub late_tolerance_us: u32,  // how late a packet may still be handed over
    pub max_advance_us: u32,     // scheduling horizon
    pub beacon_guard_us: u32,    // no downlink may end inside this window before a beacon
    pub beacon_reserved_us: u32, // airtime reserved for a beacon, any datarate
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub max_ref_age_secs: u64,
    pub xtal_init_samples: u32,
    pub xtal_filter_coef: f64,
    pub validate_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub period_s: u32, // 0 disables beaconing
    pub freq_hz: u32,
    pub freq_nb: u8,
    pub freq_step_hz: u32,
    pub datarate: u8,
    pub bandwidth_hz: u32,
    pub power_dbm: i8,
    pub infodesc: u8,
    pub latitude: f64,
    pub longitude: f64,
    pub max_retries_per_cycle: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    pub rf_chains: Vec<RfChainLimits>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RfChainLimits {
    pub freq_min_hz: u32,
    pub freq_max_hz: u32,
    /// Supported output powers in dBm.
    pub power_lut: Vec<i8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    pub wedged_sentinel: u32, // tick value reported by a concentrator that lost its clock
    pub wedged_threshold: u32,
    pub realtime_priority: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            jit: JitConfig::default(),
            gps: GpsConfig::default(),
            beacon: BeaconConfig::default(),
            tx: TxConfig::default(),
            dispatcher: DispatcherConfig::default(),
            stats_interval_secs: 30,
            status_path: None,
        }
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        let beacon_slots = 3;
        JitConfig {
            capacity: 32,
            beacon_slots,
            tx_start_delay_us: 1_500,
            tx_margin_us: 1_000,
            jit_lead_us: 30_000,
            late_tolerance_us: 1_000,
            // one beacon period (128 s) beyond the furthest pre-allocated beacon
            max_advance_us: (beacon_slots as u32 + 1) * 128_000_000,
            beacon_guard_us: 3_000_000,
            beacon_reserved_us: 2_120_000,
        }
    }
}

impl JitConfig {
    /// Minimum distance between now and a target for the packet to be admitted.
    pub fn min_lead_us(&self) -> u32 {
        self.tx_start_delay_us
            .saturating_add(self.tx_margin_us)
            .saturating_add(self.jit_lead_us)
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        GpsConfig {
            max_ref_age_secs: 30,
            xtal_init_samples: 128,
            xtal_filter_coef: 256.0,
            validate_interval_ms: 1_000,
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        BeaconConfig {
            period_s: 0,
            freq_hz: 869_525_000,
            freq_nb: 1,
            freq_step_hz: 0,
            datarate: 9,
            bandwidth_hz: 125_000,
            power_dbm: 14,
            infodesc: 0,
            latitude: 0.0,
            longitude: 0.0,
            max_retries_per_cycle: 16,
        }
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        // EU868 single-antenna board
        TxConfig {
            rf_chains: vec![RfChainLimits {
                freq_min_hz: 863_000_000,
                freq_max_hz: 870_000_000,
                power_lut: vec![12, 13, 14, 16, 20, 23, 25, 26, 27],
            }],
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            poll_interval_ms: 10,
            wedged_sentinel: 0x7E00_0000,
            wedged_threshold: 3,
            realtime_priority: true,
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SystemConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let jit = &self.jit;
        if jit.capacity == 0 {
            return Err(ConfigError::Invalid("jit.capacity must be > 0".into()));
        }
        if jit.beacon_slots >= jit.capacity {
            return Err(ConfigError::Invalid(format!(
                "jit.beacon_slots ({}) must be smaller than jit.capacity ({})",
                jit.beacon_slots, jit.capacity
            )));
        }
        // Tick deltas are only unambiguous within half the counter range.
        if jit.max_advance_us > i32::MAX as u32 {
            return Err(ConfigError::Invalid(format!(
                "jit.max_advance_us ({}) exceeds half the counter range",
                jit.max_advance_us
            )));
        }
        if jit.min_lead_us() >= jit.max_advance_us {
            return Err(ConfigError::Invalid("jit.max_advance_us is shorter than the minimum lead".into()));
        }

        if self.gps.xtal_init_samples == 0 || self.gps.xtal_filter_coef < 1.0 {
            return Err(ConfigError::Invalid("gps xtal averaging parameters must be positive".into()));
        }

        let beacon = &self.beacon;
        if beacon.period_s != 0 {
            if beacon.period_s < 6 || SECONDS_PER_DAY % beacon.period_s != 0 {
                return Err(ConfigError::Invalid(format!(
                    "beacon.period_s ({}) must be >= 6 and a divisor of {}",
                    beacon.period_s, SECONDS_PER_DAY
                )));
            }
            if !matches!(beacon.datarate, 8 | 9 | 10 | 12) {
                return Err(ConfigError::Invalid(format!(
                    "unsupported beacon datarate SF{}",
                    beacon.datarate
                )));
            }
            if !matches!(beacon.bandwidth_hz, 125_000 | 500_000) {
                return Err(ConfigError::Invalid(format!(
                    "unsupported beacon bandwidth {} Hz",
                    beacon.bandwidth_hz
                )));
            }
            if beacon.freq_nb == 0 {
                return Err(ConfigError::Invalid("beacon.freq_nb must be >= 1".into()));
            }
            let highest_hz = beacon.freq_hz as u64 + (beacon.freq_nb as u64 - 1) * beacon.freq_step_hz as u64;
            if highest_hz > u32::MAX as u64 {
                return Err(ConfigError::Invalid(format!(
                    "beacon channel plan reaches {} Hz, beyond the 32-bit frequency range",
                    highest_hz
                )));
            }
            // The scheduler queues beacon_slots beacons, the first up to one period ahead.
            let lookahead_us = (jit.beacon_slots as u64 + 1) * beacon.period_s as u64 * 1_000_000;
            if lookahead_us > jit.max_advance_us as u64 {
                return Err(ConfigError::Invalid(format!(
                    "beacon.period_s ({}) too long: {} queued beacons need {} us of jit.max_advance_us ({})",
                    beacon.period_s, jit.beacon_slots, lookahead_us, jit.max_advance_us
                )));
            }
        }

        if self.tx.rf_chains.is_empty() {
            return Err(ConfigError::Invalid("at least one tx.rf_chains entry is required".into()));
        }
        for (i, chain) in self.tx.rf_chains.iter().enumerate() {
            if chain.freq_min_hz == 0 || chain.freq_min_hz > chain.freq_max_hz {
                return Err(ConfigError::Invalid(format!("tx.rf_chains[{}] has an empty frequency range", i)));
            }
            if chain.power_lut.is_empty() {
                return Err(ConfigError::Invalid(format!("tx.rf_chains[{}] has an empty power_lut", i)));
            }
        }

        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("dispatcher.poll_interval_ms must be > 0".into()));
        }

        Ok(())
    }
}
