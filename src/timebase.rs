//! GPS time reference for the concentrator counter.
//!
//! The GPS thread latches the concentrator counter on every PPS edge and pairs it with
//! the time decoded from the matching GPS frame. The most recent accepted pair is the
//! *time reference*: every conversion between hardware ticks and absolute time is a
//! linear extrapolation from it, scaled by the measured crystal error.
//!
//! A reference older than the configured max age is never used. Callers get
//! [`TimeError::Stale`] instead of a silently extrapolated answer, and the crystal
//! tracker is sent back to Cold at the same moment.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::clock::MonotonicClock;
use crate::config::GpsConfig;
use crate::tick::{HardwareTick, TICKS_PER_SECOND};
use crate::xtal::CrystalTracker;

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06).
pub const GPS_UNIX_EPOCH_OFFSET: i64 = 315_964_800;

// Accepted counter/GPS slope window: a real crystal stays well within 10 ppm.
const SLOPE_MAX: f64 = 1.000_01;
const SLOPE_MIN: f64 = 0.999_99;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Seconds and nanoseconds since an epoch (Unix for UTC, GPS epoch for GPS time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Timespec {
            sec: sec + nsec.div_euclid(NANOS_PER_SEC),
            nsec: nsec.rem_euclid(NANOS_PER_SEC),
        }
    }

    pub fn from_secs(sec: i64) -> Self {
        Timespec { sec, nsec: 0 }
    }

    pub fn from_millis(ms: u64) -> Self {
        Timespec::new((ms / 1000) as i64, ((ms % 1000) * 1_000_000) as i64)
    }

    /// `self - earlier` in seconds. Integer parts are subtracted first to keep precision.
    pub fn delta_secs(self, earlier: Timespec) -> f64 {
        (self.sec - earlier.sec) as f64 + (self.nsec - earlier.nsec) as f64 * 1e-9
    }

    pub fn add_secs_f64(self, secs: f64) -> Timespec {
        let whole = secs.floor();
        let frac_ns = ((secs - whole) * 1e9).round() as i64;
        Timespec::new(self.sec + whole as i64, self.nsec + frac_ns)
    }

    /// Interprets `self` as GPS time and renders the matching calendar date
    /// (leap seconds ignored).
    pub fn gps_to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.sec + GPS_UNIX_EPOCH_OFFSET, self.nsec as u32)
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeReference {
    /// Monotonic clock reading when the reference was captured.
    pub captured_at: Duration,
    pub hw_tick: HardwareTick,
    pub utc: Timespec,
    pub gps: Timespec,
    /// Concentrator seconds per true second.
    pub xtal_error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SyncError {
    #[error("no previous time reference, sample used as seed")]
    NoReference,
    #[error("aberrant sync sample (counter/GPS slope {slope:.9}), keeping previous reference")]
    Aberrant { slope: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("no GPS time reference yet")]
    NoReference,
    #[error("GPS time reference is stale")]
    Stale,
    #[error("time is out of the counter range around the reference")]
    OutOfRange,
}

struct ReferenceState {
    reference: Option<TimeReference>,
    // aberrant flags of the two previous samples, newest first
    aberrant_history: [bool; 2],
}

pub struct TimeBase {
    clock: Arc<dyn MonotonicClock>,
    tracker: Arc<CrystalTracker>,
    max_age: Duration,
    state: Mutex<ReferenceState>,
}

impl TimeBase {
    pub fn new(clock: Arc<dyn MonotonicClock>, tracker: Arc<CrystalTracker>, max_age: Duration) -> Self {
        TimeBase {
            clock,
            tracker,
            max_age,
            state: Mutex::new(ReferenceState {
                reference: None,
                aberrant_history: [false; 2],
            }),
        }
    }

    pub fn from_config(clock: Arc<dyn MonotonicClock>, tracker: Arc<CrystalTracker>, config: &GpsConfig) -> Self {
        Self::new(clock, tracker, Duration::from_secs(config.max_ref_age_secs))
    }

    pub fn tracker(&self) -> &Arc<CrystalTracker> {
        &self.tracker
    }

    /// Records a PPS-latched counter value with the GPS/UTC time of that edge.
    pub fn sync(&self, hw_tick: HardwareTick, utc: Timespec, gps_time: Timespec) -> Result<(), SyncError> {
        let now = self.clock.now();
        let mut st = self.lock();

        let prev = match st.reference {
            Some(prev) => prev,
            None => {
                st.reference = Some(TimeReference {
                    captured_at: now,
                    hw_tick,
                    utc,
                    gps: gps_time,
                    xtal_error: 1.0,
                });
                info!("[gps] time reference seeded: tick={} gps={}", hw_tick, gps_time);
                return Err(SyncError::NoReference);
            }
        };

        if now.saturating_sub(prev.captured_at) > self.max_age {
            // Silent gap: the tracker restarts its warm-up from this sample.
            self.tracker.invalidate();
        }

        let cnt_diff = hw_tick.since(prev.hw_tick) as f64 / TICKS_PER_SECOND;
        let gps_diff = gps_time.delta_secs(prev.gps);
        let slope = if gps_diff != 0.0 { cnt_diff / gps_diff } else { f64::NAN };
        let aberrant = !(SLOPE_MIN..=SLOPE_MAX).contains(&slope);

        let history = st.aberrant_history;
        st.aberrant_history = [aberrant, history[0]];

        if !aberrant {
            st.reference = Some(TimeReference {
                captured_at: now,
                hw_tick,
                utc,
                gps: gps_time,
                xtal_error: slope,
            });
            self.tracker.observe(slope);
            Ok(())
        } else if history[0] && history[1] {
            // Three aberrant samples in a row: the counter or the GPS jumped for good.
            st.reference = Some(TimeReference {
                captured_at: now,
                hw_tick,
                utc,
                gps: gps_time,
                xtal_error: prev.xtal_error,
            });
            warn!("[gps] time reference reset after repeated aberrant samples (slope {:.9})", slope);
            Ok(())
        } else {
            Err(SyncError::Aberrant { slope })
        }
    }

    pub fn tick_to_utc(&self, tick: HardwareTick) -> Result<Timespec, TimeError> {
        let r = self.current()?;
        Ok(r.utc.add_secs_f64(Self::ticks_to_secs(&r, tick)))
    }

    pub fn tick_to_gps(&self, tick: HardwareTick) -> Result<Timespec, TimeError> {
        let r = self.current()?;
        Ok(r.gps.add_secs_f64(Self::ticks_to_secs(&r, tick)))
    }

    pub fn gps_to_tick(&self, gps_time: Timespec) -> Result<HardwareTick, TimeError> {
        let r = self.current()?;
        Self::secs_to_tick(&r, gps_time.delta_secs(r.gps))
    }

    pub fn utc_to_tick(&self, utc: Timespec) -> Result<HardwareTick, TimeError> {
        let r = self.current()?;
        Self::secs_to_tick(&r, utc.delta_secs(r.utc))
    }

    /// Age check only; never translates anything.
    pub fn is_valid(&self) -> bool {
        self.current().is_ok()
    }

    /// Copy of the current reference, failing closed like the conversions.
    pub fn snapshot(&self) -> Result<TimeReference, TimeError> {
        self.current()
    }

    pub fn age(&self) -> Option<Duration> {
        let st = self.lock();
        st.reference.map(|r| self.clock.now().saturating_sub(r.captured_at))
    }

    /// Periodic validity pass run by the GPS thread.
    pub fn validate(&self) -> bool {
        let reference = self.current();
        let xtal = self.tracker.snapshot();
        let age = self
            .age()
            .map_or_else(|| "none".to_string(), |a| format!("{:.1} s old", a.as_secs_f64()));
        let when = reference
            .ok()
            .and_then(|r| r.gps.gps_to_datetime())
            .map_or_else(|| "-".to_string(), |d| d.format("%Y-%m-%d %H:%M:%S").to_string());
        info!(
            "[gps] time ref: {} ({}, GPS {}), xtal correction: {} ({:.15})",
            if reference.is_ok() { "valid" } else { "invalid" },
            age,
            when,
            if xtal.valid { "valid" } else { "invalid" },
            xtal.factor
        );
        reference.is_ok()
    }

    // Tracker updates and resets happen under the reference lock only, so a stale
    // verdict cannot wipe a sample fed by a concurrent sync.
    fn current(&self) -> Result<TimeReference, TimeError> {
        let now = self.clock.now();
        let st = self.lock();
        match st.reference {
            None => Err(TimeError::NoReference),
            Some(r) if now.saturating_sub(r.captured_at) > self.max_age => {
                self.tracker.invalidate();
                Err(TimeError::Stale)
            }
            Some(r) => Ok(r),
        }
    }

    fn ticks_to_secs(r: &TimeReference, tick: HardwareTick) -> f64 {
        tick.since(r.hw_tick) as f64 / (TICKS_PER_SECOND * r.xtal_error)
    }

    fn secs_to_tick(r: &TimeReference, delta_secs: f64) -> Result<HardwareTick, TimeError> {
        let ticks = (delta_secs * TICKS_PER_SECOND * r.xtal_error).round();
        if !ticks.is_finite() || ticks.abs() > i32::MAX as f64 {
            return Err(TimeError::OutOfRange);
        }
        Ok(r.hw_tick.offset_us(ticks as i64))
    }

    fn lock(&self) -> MutexGuard<'_, ReferenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
