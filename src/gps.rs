//! GPS side: pairs every PPS-latched counter value with the decoded GPS time.

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::status::SharedStats;
use crate::timebase::{SyncError, TimeBase};
use crate::traits::{Concentrator, GpsSource};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    NoFix,
    Seeded,
    Synced,
    Rejected { slope: f64 },
}

pub struct GpsSynchronizer<G: GpsSource, C: Concentrator> {
    gps: G,
    concentrator: Arc<Mutex<C>>,
    timebase: Arc<TimeBase>,
}

impl<G: GpsSource, C: Concentrator> GpsSynchronizer<G, C> {
    pub fn new(gps: G, concentrator: Arc<Mutex<C>>, timebase: Arc<TimeBase>) -> Self {
        GpsSynchronizer {
            gps,
            concentrator,
            timebase,
        }
    }

    /// Waits for one GPS time message and feeds it to the time base.
    pub fn process_next(&mut self) -> Result<SyncOutcome> {
        let Some(fix) = self.gps.next_fix()? else {
            return Ok(SyncOutcome::NoFix);
        };
        let trigger = self
            .concentrator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trigger_count()?;

        let outcome = match self.timebase.sync(trigger, fix.utc, fix.gps) {
            Ok(()) => {
                debug!("[gps] synced tick {} to GPS {}", trigger, fix.gps);
                SyncOutcome::Synced
            }
            Err(SyncError::NoReference) => SyncOutcome::Seeded,
            Err(SyncError::Aberrant { slope }) => {
                warn!("[gps] aberrant sync sample ignored (slope {:.9})", slope);
                SyncOutcome::Rejected { slope }
            }
        };
        Ok(outcome)
    }

    pub fn run(&mut self, running: &AtomicBool) {
        info!("[gps] synchronisation started");
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.process_next() {
                warn!("[gps] {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Periodic validity pass: ages the time reference and mirrors it into the statistics.
pub fn validation_loop(timebase: Arc<TimeBase>, stats: SharedStats, interval: Duration, running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        refresh_timing_stats(&timebase, &stats);
        thread::sleep(interval);
    }
}

pub fn refresh_timing_stats(timebase: &TimeBase, stats: &SharedStats) {
    let valid = timebase.validate();
    let xtal = timebase.tracker().snapshot();
    let mut s = stats.write().unwrap_or_else(PoisonError::into_inner);
    s.time_ref_valid = valid;
    s.xtal_valid = xtal.valid;
    s.xtal_factor = xtal.factor;
}
