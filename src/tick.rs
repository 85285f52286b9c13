//! Concentrator tick arithmetic.
//!
//! The concentrator counts microseconds in a free-running 32-bit register that wraps
//! roughly every 71.6 minutes. A raw value only means something relative to another
//! one, so every comparison goes through a wrapping difference reinterpreted as signed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counter frequency of the concentrator (1 MHz).
pub const TICKS_PER_SECOND: f64 = 1_000_000.0;

/// A value of the concentrator's 32-bit microsecond counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HardwareTick(pub u32);

impl HardwareTick {
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Tick `us` microseconds later (wrapping).
    pub const fn add_us(self, us: u32) -> Self {
        HardwareTick(self.0.wrapping_add(us))
    }

    /// Tick shifted by a signed amount of microseconds (wrapping).
    pub const fn offset_us(self, us: i64) -> Self {
        HardwareTick(self.0.wrapping_add(us as u32))
    }

    /// Signed distance from `origin` to `self`: positive when `self` is after `origin`.
    ///
    /// Correct as long as both ticks are within 2^31 µs (~35 minutes) of each other.
    pub const fn since(self, origin: HardwareTick) -> i32 {
        self.0.wrapping_sub(origin.0) as i32
    }

    /// Forward distance from `origin` to `self`, assuming `self` is not before `origin`.
    pub const fn elapsed_since(self, origin: HardwareTick) -> u32 {
        self.0.wrapping_sub(origin.0)
    }

    pub fn is_after(self, other: HardwareTick) -> bool {
        self.since(other) > 0
    }
}

impl From<u32> for HardwareTick {
    fn from(raw: u32) -> Self {
        HardwareTick(raw)
    }
}

impl fmt::Display for HardwareTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
