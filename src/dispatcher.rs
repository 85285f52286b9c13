//! Consumer side of the JIT queue: hands due packets to the concentrator.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::DispatcherConfig;
use crate::jit::{JitQueue, PacketClass};
use crate::status::SharedStats;
use crate::tick::HardwareTick;
use crate::traits::{Concentrator, TxStatus};
use crate::xtal::CrystalTracker;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The counter is stuck on the value a concentrator reports after losing its clock.
    #[error("concentrator clock wedged at {0}")]
    ClockWedged(HardwareTick),
    #[error("concentrator access failed: {0}")]
    Hardware(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Idle,
    Sent { class: PacketClass, target: HardwareTick },
    /// Radio still emitting the previous packet.
    Dropped { class: PacketClass },
    Failed { class: PacketClass },
}

pub struct TxDispatcher<C: Concentrator> {
    queue: Arc<JitQueue>,
    concentrator: Arc<Mutex<C>>,
    tracker: Arc<CrystalTracker>,
    stats: SharedStats,
    config: DispatcherConfig,
    wedged_polls: u32,
    missed_reported: u64,
}

impl<C: Concentrator> TxDispatcher<C> {
    pub fn new(
        queue: Arc<JitQueue>,
        concentrator: Arc<Mutex<C>>,
        tracker: Arc<CrystalTracker>,
        stats: SharedStats,
        config: DispatcherConfig,
    ) -> Self {
        TxDispatcher {
            queue,
            concentrator,
            tracker,
            stats,
            config,
            wedged_polls: 0,
            missed_reported: 0,
        }
    }

    pub fn run_iteration(&mut self) -> Result<DispatchOutcome, DispatchError> {
        let now = self.hw().instant_count()?;

        if now.raw() == self.config.wedged_sentinel {
            self.wedged_polls += 1;
            if self.wedged_polls >= self.config.wedged_threshold {
                return Err(DispatchError::ClockWedged(now));
            }
            return Ok(DispatchOutcome::Idle);
        }
        self.wedged_polls = 0;

        let ready = self.queue.peek(now);
        self.report_missed();
        let Some(index) = ready else {
            return Ok(DispatchOutcome::Idle);
        };

        // A concurrent cancel may have emptied the slot since peek.
        let Ok(mut entry) = self.queue.dequeue(index) else {
            return Ok(DispatchOutcome::Idle);
        };
        let class = entry.class;

        if class == PacketClass::Beacon {
            let factor = self.tracker.factor();
            let corrected = (factor * entry.packet.freq_hz as f64) as u32;
            debug!(
                "[jit] beacon frequency {} Hz corrected to {} Hz (xtal {:.15})",
                entry.packet.freq_hz, corrected, factor
            );
            entry.packet.freq_hz = corrected;
        }

        let outcome = {
            let mut hw = self.hw();
            match hw.tx_status(entry.packet.rf_chain) {
                Ok(TxStatus::Emitting) => {
                    warn!(
                        "[jit] radio busy emitting, dropping {:?} for tick {}",
                        class, entry.target_tick
                    );
                    DispatchOutcome::Dropped { class }
                }
                Ok(status) => {
                    if status == TxStatus::Scheduled {
                        warn!("[jit] a packet was already scheduled, overwriting it");
                    }
                    match hw.send(&entry.packet, entry.target_tick) {
                        Ok(()) => DispatchOutcome::Sent {
                            class,
                            target: entry.target_tick,
                        },
                        Err(e) => {
                            warn!("[jit] sending {:?} for tick {} failed: {}", class, entry.target_tick, e);
                            DispatchOutcome::Failed { class }
                        }
                    }
                }
                Err(e) => {
                    warn!("[jit] cannot read TX status: {}", e);
                    DispatchOutcome::Failed { class }
                }
            }
        };

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            DispatchOutcome::Sent { class, target } => {
                stats.tx_ok += 1;
                if class == PacketClass::Beacon {
                    stats.beacon_sent += 1;
                    info!("[jit] beacon sent for tick {}", target);
                } else {
                    debug!("[jit] {:?} sent for tick {}", class, target);
                }
            }
            DispatchOutcome::Dropped { .. } | DispatchOutcome::Failed { .. } => stats.tx_fail += 1,
            DispatchOutcome::Idle => {}
        }
        Ok(outcome)
    }

    /// Polls until `running` is cleared. Only a wedged concentrator clock ends it early.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), DispatchError> {
        if self.config.realtime_priority {
            enable_realtime_priority();
        }
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        info!("[jit] dispatcher started, polling every {:?}", interval);

        while running.load(Ordering::SeqCst) {
            match self.run_iteration() {
                Ok(_) => {}
                Err(e @ DispatchError::ClockWedged(_)) => {
                    error!("[jit] {}", e);
                    return Err(e);
                }
                Err(e) => warn!("[jit] {}", e),
            }
            thread::sleep(interval);
        }
        info!("[jit] dispatcher stopped, {} entries abandoned", self.queue.len());
        Ok(())
    }

    fn report_missed(&mut self) {
        let missed = self.queue.missed_total();
        if missed > self.missed_reported {
            let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
            stats.tx_dropped_missed += missed - self.missed_reported;
            self.missed_reported = missed;
        }
    }

    fn hw(&self) -> MutexGuard<'_, C> {
        self.concentrator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// SCHED_FIFO for the calling thread.
pub fn enable_realtime_priority() {
    #[cfg(target_os = "linux")]
    {
        unsafe {
            let param = libc::sched_param { sched_priority: 50 };
            if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
                info!("Realtime priority (SCHED_FIFO, 50) enabled for the dispatcher.");
            } else {
                let err = std::io::Error::last_os_error();
                warn!("Failed to set realtime priority: {}. TX timing might suffer.", err);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!("Realtime priority not supported on this platform.");
    }
}
