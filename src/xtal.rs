//! Concentrator crystal drift compensation.
//!
//! Each accepted GPS sync yields a `xtal_error` sample: the number of concentrator
//! seconds that elapsed per true second. The tracker turns those samples into a
//! multiplicative correction for the beacon carrier frequency:
//!
//! 1. **Cold**: no usable time reference, factor pinned to 1.0.
//! 2. **WarmingUp**: the first samples are summed for an arithmetic mean.
//! 3. **Tracking**: each sample nudges the factor through a first-order low-pass filter.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

use crate::config::GpsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XtalPhase {
    Cold,
    WarmingUp,
    Tracking,
}

/// What consumers are allowed to see.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XtalCorrection {
    pub valid: bool,
    pub factor: f64,
}

#[derive(Debug, Clone)]
struct CorrectionState {
    phase: XtalPhase,
    valid: bool,
    factor: f64,
    init_samples_seen: u32,
    init_accumulator: f64,
}

impl CorrectionState {
    fn cold() -> Self {
        CorrectionState {
            phase: XtalPhase::Cold,
            valid: false,
            factor: 1.0,
            init_samples_seen: 0,
            init_accumulator: 0.0,
        }
    }
}

pub struct CrystalTracker {
    init_samples: u32,
    filter_coef: f64,
    state: Mutex<CorrectionState>,
}

impl CrystalTracker {
    pub fn new(init_samples: u32, filter_coef: f64) -> Self {
        CrystalTracker {
            init_samples,
            filter_coef,
            state: Mutex::new(CorrectionState::cold()),
        }
    }

    pub fn from_config(config: &GpsConfig) -> Self {
        Self::new(config.xtal_init_samples, config.xtal_filter_coef)
    }

    /// Feeds one `xtal_error` sample taken from a valid time reference.
    pub fn observe(&self, xtal_error: f64) {
        if !xtal_error.is_finite() || xtal_error <= 0.0 {
            debug!("[xtal] ignoring unusable sample {}", xtal_error);
            return;
        }

        let mut st = self.lock();
        let phase = st.phase;
        match phase {
            XtalPhase::Cold | XtalPhase::WarmingUp if st.init_samples_seen < self.init_samples => {
                st.phase = XtalPhase::WarmingUp;
                st.init_accumulator += xtal_error;
                st.init_samples_seen += 1;
            }
            XtalPhase::Cold | XtalPhase::WarmingUp => {
                // The observation after the last warm-up sample only closes the average.
                st.factor = self.init_samples as f64 / st.init_accumulator;
                st.valid = true;
                st.phase = XtalPhase::Tracking;
                info!("[xtal] correction initialised: {:.15}", st.factor);
            }
            XtalPhase::Tracking => {
                let x = 1.0 / xtal_error;
                st.factor = st.factor - st.factor / self.filter_coef + x / self.filter_coef;
            }
        }
    }

    /// Back to Cold; called whenever the time reference goes stale.
    pub fn invalidate(&self) {
        let mut st = self.lock();
        if st.phase != XtalPhase::Cold {
            info!("[xtal] time reference lost, correction invalidated");
        }
        *st = CorrectionState::cold();
    }

    pub fn snapshot(&self) -> XtalCorrection {
        let st = self.lock();
        XtalCorrection {
            valid: st.valid,
            factor: st.factor,
        }
    }

    pub fn factor(&self) -> f64 {
        self.lock().factor
    }

    pub fn is_valid(&self) -> bool {
        self.lock().valid
    }

    pub fn phase(&self) -> XtalPhase {
        self.lock().phase
    }

    pub fn samples_seen(&self) -> u32 {
        self.lock().init_samples_seen
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CorrectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CrystalTracker {
    fn default() -> Self {
        Self::from_config(&GpsConfig::default())
    }
}
