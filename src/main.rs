use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use jitfwd::beacon::BeaconScheduler;
use jitfwd::clock::{MonotonicClock, StdClock};
use jitfwd::config::SystemConfig;
use jitfwd::dispatcher::{DispatchError, TxDispatcher};
use jitfwd::downlink::{DownlinkAdmission, DownlinkRequest, DownlinkTiming, TxLimits};
use jitfwd::gps::{validation_loop, GpsSynchronizer};
use jitfwd::jit::JitQueue;
use jitfwd::packet::TxPacket;
use jitfwd::sim::{SimConcentrator, SimGps, LEAP_SECONDS};
use jitfwd::status::{DownlinkStats, SharedStats};
use jitfwd::tick::HardwareTick;
use jitfwd::timebase::{TimeBase, Timespec, GPS_UNIX_EPOCH_OFFSET};
use jitfwd::traits::Concentrator;
use jitfwd::xtal::CrystalTracker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "/var/run/jitfwd.lock")]
    lock_file: PathBuf,

    /// Drift of the simulated concentrator crystal
    #[arg(long, default_value_t = 0.0)]
    sim_drift_ppm: f64,

    /// Seconds between synthetic downlink requests (0 disables them)
    #[arg(long, default_value_t = 0)]
    sim_downlink_period: u64,
}

fn acquire_singleton_lock(lock_path: &Path) -> Result<File> {
    let file = File::create(lock_path).map_err(|e| anyhow!("Failed to create lock file {:?}: {}", lock_path, e))?;

    #[cfg(unix)]
    {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "Another instance of jitfwd is already running! (Lockfile: {:?})",
                lock_path
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        Ok(file)
    }
}

fn notify_ready() {
    #[cfg(unix)]
    {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            warn!("Failed to notify systemd: {}", e);
        }
    }
}

/// Shared core handed to every thread.
struct Core {
    clock: Arc<dyn MonotonicClock>,
    timebase: Arc<TimeBase>,
    queue: Arc<JitQueue>,
    stats: SharedStats,
    concentrator: Arc<Mutex<SimConcentrator>>,
}

fn current_tick(concentrator: &Mutex<SimConcentrator>) -> Result<HardwareTick> {
    concentrator.lock().unwrap_or_else(PoisonError::into_inner).instant_count()
}

/// Downlink thread: keeps beacons queued and optionally injects synthetic traffic.
fn downlink_loop(core: &Core, config: &SystemConfig, admission: &DownlinkAdmission, period: u64, running: &AtomicBool) {
    let mut scheduler = BeaconScheduler::new(
        config.beacon.clone(),
        core.queue.clone(),
        core.timebase.clone(),
        core.stats.clone(),
    );
    let mut last_request = Instant::now();
    let mut round = 0u64;

    while running.load(Ordering::SeqCst) {
        let now = match current_tick(&core.concentrator) {
            Ok(t) => t,
            Err(e) => {
                warn!("[downlink] {}", e);
                thread::sleep(Duration::from_millis(200));
                continue;
            }
        };
        scheduler.poll(now);

        if period > 0 && last_request.elapsed() >= Duration::from_secs(period) {
            last_request = Instant::now();
            round += 1;
            let timing = match round % 3 {
                0 => DownlinkTiming::Immediate,
                1 => DownlinkTiming::Timestamp(now.add_us(1_000_000)),
                _ => match core.timebase.tick_to_gps(now) {
                    Ok(gps) => DownlinkTiming::GpsTime(Timespec::from_secs(gps.sec + 3)),
                    Err(_) => DownlinkTiming::Timestamp(now.add_us(1_000_000)),
                },
            };
            let packet = TxPacket::lora_downlink(869_525_000, 9, 125_000, round.to_le_bytes().to_vec());
            let outcome = admission.submit(DownlinkRequest { timing, packet }, now);
            if let Some(code) = outcome.ack_code() {
                info!("[downlink] synthetic request {} acknowledged with {}", round, code);
            }
        }

        thread::sleep(Duration::from_millis(200));
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };

    let _lock_file = match acquire_singleton_lock(&args.lock_file) {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let clock: Arc<dyn MonotonicClock> = Arc::new(StdClock::new());
    let tracker = Arc::new(CrystalTracker::from_config(&config.gps));
    let core = Arc::new(Core {
        clock: clock.clone(),
        timebase: Arc::new(TimeBase::from_config(clock.clone(), tracker.clone(), &config.gps)),
        queue: Arc::new(JitQueue::new(config.jit.clone())),
        stats: DownlinkStats::shared(),
        concentrator: Arc::new(Mutex::new(SimConcentrator::new(clock.clone(), args.sim_drift_ppm))),
    });
    info!(
        "Simulated concentrator started (drift {} ppm), queue capacity {}, beacon period {} s",
        args.sim_drift_ppm, config.jit.capacity, config.beacon.period_s
    );

    let gps_start = chrono::Utc::now().timestamp() - GPS_UNIX_EPOCH_OFFSET + LEAP_SECONDS;
    let gps_handle = {
        let core = core.clone();
        let running = running.clone();
        thread::Builder::new().name("gps".into()).spawn(move || {
            let gps = SimGps::new(core.clock.clone(), gps_start, true);
            GpsSynchronizer::new(gps, core.concentrator.clone(), core.timebase.clone()).run(&running);
        })?
    };

    let valid_handle = {
        let core = core.clone();
        let running = running.clone();
        let interval = Duration::from_millis(config.gps.validate_interval_ms);
        thread::Builder::new()
            .name("valid".into())
            .spawn(move || validation_loop(core.timebase.clone(), core.stats.clone(), interval, &running))?
    };

    let jit_handle = {
        let core = core.clone();
        let running = running.clone();
        let tracker = tracker.clone();
        let dispatcher_config = config.dispatcher.clone();
        thread::Builder::new().name("jit".into()).spawn(move || {
            let mut dispatcher = TxDispatcher::new(
                core.queue.clone(),
                core.concentrator.clone(),
                tracker,
                core.stats.clone(),
                dispatcher_config,
            );
            let result = dispatcher.run(&running);
            if result.is_err() {
                running.store(false, Ordering::SeqCst);
            }
            result
        })?
    };

    let down_handle = {
        let core = core.clone();
        let running = running.clone();
        let config = config.clone();
        let period = args.sim_downlink_period;
        thread::Builder::new().name("down".into()).spawn(move || {
            let admission = DownlinkAdmission::new(
                core.queue.clone(),
                core.timebase.clone(),
                TxLimits::from_config(&config.tx),
                core.stats.clone(),
            );
            downlink_loop(&core, &config, &admission, period, &running);
        })?
    };

    notify_ready();
    info!("All threads started.");

    let mut last_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        if last_log.elapsed() >= Duration::from_secs(config.stats_interval_secs) {
            let snapshot = {
                let mut stats = core.stats.write().unwrap_or_else(PoisonError::into_inner);
                stats.queue_len = core.queue.len();
                stats.touch();
                stats.clone()
            };
            snapshot.log_summary();
            if let Some(path) = &config.status_path {
                if let Err(e) = snapshot.write_json(path) {
                    warn!("{}", e);
                }
            }
            last_log = Instant::now();
        }
        thread::sleep(Duration::from_millis(100));
    }

    let dispatch_result = jit_handle.join().map_err(|_| anyhow!("dispatcher thread panicked"))?;
    for (name, handle) in [("down", down_handle), ("valid", valid_handle)] {
        if handle.join().is_err() {
            warn!("{} thread panicked", name);
        }
    }
    // The GPS thread may still be sleeping until the next PPS; it exits on its own.
    drop(gps_handle);

    match dispatch_result {
        Err(e @ DispatchError::ClockWedged(_)) => {
            error!("Exiting: {}. Concentrator restart required.", e);
            Err(e.into())
        }
        _ => {
            info!("Exiting.");
            Ok(())
        }
    }
}
