//! Transmit packet description handed to the concentrator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// FSK sync word length configured on the concentrator, in bytes.
const FSK_SYNC_WORD_SIZE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    Immediate,
    Timestamped,
    /// Triggered on the GPS PPS edge (beacons).
    OnGps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeRate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
}

impl CodeRate {
    /// Extra redundancy symbols per 4 data bits (CR in the airtime formula).
    fn redundancy(self) -> u32 {
        match self {
            CodeRate::Cr4_5 => 1,
            CodeRate::Cr4_6 => 2,
            CodeRate::Cr4_7 => 3,
            CodeRate::Cr4_8 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Modulation {
    Lora {
        spreading_factor: u8,
        bandwidth_hz: u32,
        coderate: CodeRate,
    },
    Fsk {
        datarate_bps: u32,
        freq_deviation_hz: u32,
    },
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modulation::Lora { spreading_factor, bandwidth_hz, .. } => {
                write!(f, "SF{}BW{}", spreading_factor, bandwidth_hz / 1000)
            }
            Modulation::Fsk { datarate_bps, .. } => write!(f, "FSK {}bps", datarate_bps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPacket {
    pub freq_hz: u32,
    pub rf_chain: u8,
    pub rf_power: i8,
    pub tx_mode: TxMode,
    pub modulation: Modulation,
    pub preamble: u16,
    pub invert_pol: bool,
    pub no_crc: bool,
    pub no_header: bool,
    pub payload: Vec<u8>,
}

impl TxPacket {
    /// A LoRaWAN-style downlink: inverted polarity, no payload CRC, 8 symbol preamble.
    pub fn lora_downlink(freq_hz: u32, spreading_factor: u8, bandwidth_hz: u32, payload: Vec<u8>) -> Self {
        TxPacket {
            freq_hz,
            rf_chain: 0,
            rf_power: 14,
            tx_mode: TxMode::Timestamped,
            modulation: Modulation::Lora {
                spreading_factor,
                bandwidth_hz,
                coderate: CodeRate::Cr4_5,
            },
            preamble: 8,
            invert_pol: true,
            no_crc: true,
            no_header: false,
            payload,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Time on air in microseconds, rounded up. Zero for unsupported parameters.
    pub fn time_on_air_us(&self) -> u32 {
        match self.modulation {
            Modulation::Lora { spreading_factor, bandwidth_hz, coderate } => {
                if !(5..=12).contains(&spreading_factor) || bandwidth_hz == 0 {
                    return 0;
                }
                let sf = spreading_factor as i64;
                let symbol_us = (1u64 << spreading_factor) as f64 * 1e6 / bandwidth_hz as f64;
                let preamble_us = (self.preamble as f64 + 4.25) * symbol_us;

                let header = if self.no_header { 1 } else { 0 };
                let crc = if self.no_crc { 0 } else { 1 };
                // low datarate optimisation
                let de = if spreading_factor >= 11 && bandwidth_hz <= 125_000 { 1 } else { 0 };

                let numerator = 8 * self.payload.len() as i64 - 4 * sf + 28 + 16 * crc - 20 * header;
                let denominator = 4 * (sf - 2 * de);
                let blocks = if numerator > 0 {
                    (numerator + denominator - 1) / denominator
                } else {
                    0
                };
                let payload_symbols = 8 + blocks * (coderate.redundancy() as i64 + 4);
                let total = preamble_us + payload_symbols as f64 * symbol_us;
                total.ceil() as u32
            }
            Modulation::Fsk { datarate_bps, .. } => {
                if datarate_bps == 0 {
                    return 0;
                }
                let crc_bytes = if self.no_crc { 0 } else { 2 };
                let bytes = self.preamble as u32 + FSK_SYNC_WORD_SIZE + 1 + self.payload.len() as u32 + crc_bytes;
                let us = (8 * bytes) as f64 * 1e6 / datarate_bps as f64;
                us.ceil() as u32 + 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_time_on_air_sf7() {
        // 10 bytes, SF7/125kHz, CR 4/5, explicit header, CRC on: 41.216 ms
        let mut pkt = TxPacket::lora_downlink(868_100_000, 7, 125_000, vec![0u8; 10]);
        pkt.no_crc = false;
        assert_eq!(pkt.time_on_air_us(), 41_216);
    }

    #[test]
    fn test_lora_time_on_air_sf12_low_datarate() {
        // 12 bytes, SF12/125kHz, CR 4/5, CRC off: 991.232 ms
        let pkt = TxPacket::lora_downlink(869_525_000, 12, 125_000, vec![0u8; 12]);
        assert_eq!(pkt.time_on_air_us(), 991_232);
    }

    #[test]
    fn test_fsk_time_on_air() {
        let pkt = TxPacket {
            freq_hz: 868_800_000,
            rf_chain: 0,
            rf_power: 14,
            tx_mode: TxMode::Timestamped,
            modulation: Modulation::Fsk {
                datarate_bps: 50_000,
                freq_deviation_hz: 25_000,
            },
            preamble: 5,
            invert_pol: false,
            no_crc: false,
            no_header: false,
            payload: vec![0u8; 20],
        };
        // (5 + 3 + 1 + 20 + 2) bytes * 8 / 50 kbps = 4.96 ms
        assert_eq!(pkt.time_on_air_us(), 4_961);
    }

    #[test]
    fn test_unsupported_parameters_yield_zero() {
        let pkt = TxPacket::lora_downlink(868_100_000, 13, 125_000, vec![1, 2, 3]);
        assert_eq!(pkt.time_on_air_us(), 0);
    }
}
