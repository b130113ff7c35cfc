use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

use crate::core::queue::BlockingQueue;
use crate::core::sync::{lock_unpoisoned, panic_details};
use crate::error::TapeflowError;
use crate::proxy::TapedProxy;
use crate::stats::TapeSessionStats;
use crate::telemetry;
use crate::telemetry::tags;
use crate::types::{Result, SessionType};

struct WatchDogShared {
    session_type: SessionType,
    unit: String,
    started_at: Instant,
    bytes_moved: AtomicU64,
    blocks_moved: AtomicU64,
    last_movement_us: AtomicU64,
    current_file: Mutex<Option<(u64, u64)>>,
    stuck_reported: AtomicBool,
    error_counts: Mutex<BTreeMap<String, u32>>,
    params_to_add: BlockingQueue<(String, String)>,
    params_to_delete: BlockingQueue<String>,
    stats: Mutex<Option<TapeSessionStats>>,
    heartbeats: AtomicU64,
    stuck_events: AtomicU64,
}

impl WatchDogShared {
    fn elapsed_us(&self) -> u64 {
        self.started_at.elapsed().as_micros().min(u64::MAX as u128) as u64
    }
}

/// Cloneable handle the data threads use to feed the watchdog.
#[derive(Clone)]
pub struct WatchDogHandle {
    shared: Arc<WatchDogShared>,
}

impl WatchDogHandle {
    /// Records one block moved by the tape thread. Lock free.
    pub fn notify(&self, bytes: u64) {
        self.shared.bytes_moved.fetch_add(bytes, Ordering::Relaxed);
        self.shared.blocks_moved.fetch_add(1, Ordering::Relaxed);
        self.shared
            .last_movement_us
            .store(self.shared.elapsed_us(), Ordering::Relaxed);
    }

    /// Starts stuck-file tracking for a new file.
    pub fn notify_begin_new_job(&self, file_id: u64, fseq: u64) {
        *lock_unpoisoned(&self.shared.current_file) = Some((file_id, fseq));
        self.shared
            .last_movement_us
            .store(self.shared.elapsed_us(), Ordering::Relaxed);
        self.shared.stuck_reported.store(false, Ordering::Relaxed);
    }

    pub fn file_finished(&self) {
        *lock_unpoisoned(&self.shared.current_file) = None;
    }

    /// Queues a parameter to attach to the supervisor's log context.
    pub fn add_parameter(&self, name: impl Into<String>, value: impl Into<String>) {
        self.shared
            .params_to_add
            .push((name.into(), value.into()));
    }

    pub fn delete_parameter(&self, name: impl Into<String>) {
        self.shared.params_to_delete.push(name.into());
    }

    pub fn add_to_error_count(&self, name: &str) {
        *lock_unpoisoned(&self.shared.error_counts)
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    pub fn set_error_count(&self, name: &str, value: u32) {
        lock_unpoisoned(&self.shared.error_counts).insert(name.to_string(), value);
    }

    /// True once any `Error_*` counter is non-zero.
    pub fn error_happened(&self) -> bool {
        lock_unpoisoned(&self.shared.error_counts)
            .iter()
            .any(|(name, count)| name.starts_with("Error_") && *count > 0)
    }

    pub fn error_counts(&self) -> BTreeMap<String, u32> {
        lock_unpoisoned(&self.shared.error_counts).clone()
    }

    pub fn update_stats(&self, stats: &TapeSessionStats) {
        *lock_unpoisoned(&self.shared.stats) = Some(stats.clone());
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.shared.heartbeats.load(Ordering::Relaxed)
    }

    pub fn stuck_events(&self) -> u64 {
        self.shared.stuck_events.load(Ordering::Relaxed)
    }
}

/// Periodic liveness reporter for a running session.
///
/// Wakes every poll period; sends a heartbeat with the bytes and blocks
/// moved since the previous one, flags files that stopped moving, and
/// forwards queued log parameters to the supervisor.
pub struct TaskWatchDog {
    shared: Arc<WatchDogShared>,
    proxy: Arc<dyn TapedProxy>,
    heartbeat_period: Duration,
    stuck_period: Duration,
    poll_period: Duration,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TaskWatchDog {
    pub fn new(
        session_type: SessionType,
        unit: impl Into<String>,
        heartbeat_period: Duration,
        stuck_period: Duration,
        poll_period: Duration,
        proxy: Arc<dyn TapedProxy>,
    ) -> Self {
        Self {
            shared: Arc::new(WatchDogShared {
                session_type,
                unit: unit.into(),
                started_at: Instant::now(),
                bytes_moved: AtomicU64::new(0),
                blocks_moved: AtomicU64::new(0),
                last_movement_us: AtomicU64::new(0),
                current_file: Mutex::new(None),
                stuck_reported: AtomicBool::new(false),
                error_counts: Mutex::new(BTreeMap::new()),
                params_to_add: BlockingQueue::new(),
                params_to_delete: BlockingQueue::new(),
                stats: Mutex::new(None),
                heartbeats: AtomicU64::new(0),
                stuck_events: AtomicU64::new(0),
            }),
            proxy,
            heartbeat_period,
            stuck_period,
            poll_period,
            stop: None,
            thread: None,
        }
    }

    pub fn handle(&self) -> WatchDogHandle {
        WatchDogHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn start_thread(&mut self) {
        let shared = Arc::clone(&self.shared);
        let proxy = Arc::clone(&self.proxy);
        let (heartbeat_period, stuck_period, poll_period) =
            (self.heartbeat_period, self.stuck_period, self.poll_period);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        self.stop = Some(stop_tx);
        self.thread = Some(thread::spawn(move || {
            let mut last_heartbeat = Instant::now();
            // A stop message or a dropped sender both end the loop.
            while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(poll_period) {
                check_stuck(&shared, stuck_period);
                forward_params(&shared, proxy.as_ref());
                if last_heartbeat.elapsed() >= heartbeat_period {
                    heartbeat(&shared, proxy.as_ref());
                    last_heartbeat = Instant::now();
                }
            }
            heartbeat(&shared, proxy.as_ref());
            forward_params(&shared, proxy.as_ref());
            let error_counts = lock_unpoisoned(&shared.error_counts).clone();
            tracing::info!(
                session_type = shared.session_type.as_str(),
                heartbeats = shared.heartbeats.load(Ordering::Relaxed),
                ?error_counts,
                "watchdog stopped"
            );
        }));
    }

    /// Stops the watchdog after one final heartbeat and joins its thread.
    pub fn stop_and_wait(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|payload| {
                TapeflowError::Other(anyhow::anyhow!(
                    "watchdog thread panicked: {}",
                    panic_details(payload.as_ref())
                ))
            }),
            None => Ok(()),
        }
    }
}

fn heartbeat(shared: &WatchDogShared, proxy: &dyn TapedProxy) {
    let bytes = shared.bytes_moved.swap(0, Ordering::Relaxed);
    let blocks = shared.blocks_moved.swap(0, Ordering::Relaxed);
    proxy.report_heartbeat(bytes, blocks);
    shared.heartbeats.fetch_add(1, Ordering::Relaxed);
    telemetry::increment_counter(
        tags::METRIC_WATCHDOG_HEARTBEAT_COUNT,
        1,
        &[("subsystem", "watchdog"), ("op", "heartbeat")],
    );
    if let Some(stats) = lock_unpoisoned(&shared.stats).as_ref() {
        proxy.add_log_params(&shared.unit, &stats.log_params());
    }
}

fn check_stuck(shared: &WatchDogShared, stuck_period: Duration) {
    let Some((file_id, fseq)) = *lock_unpoisoned(&shared.current_file) else {
        return;
    };
    let idle_us = shared
        .elapsed_us()
        .saturating_sub(shared.last_movement_us.load(Ordering::Relaxed));
    if Duration::from_micros(idle_us) < stuck_period
        || shared.stuck_reported.swap(true, Ordering::Relaxed)
    {
        return;
    }
    shared.stuck_events.fetch_add(1, Ordering::Relaxed);
    telemetry::increment_counter(
        tags::METRIC_WATCHDOG_STUCK_COUNT,
        1,
        &[("subsystem", "watchdog"), ("op", "stuck")],
    );
    tracing::warn!(
        session_type = shared.session_type.as_str(),
        file_id,
        fseq,
        idle_secs = idle_us / 1_000_000,
        "no data movement for too long, file transfer may be stuck"
    );
}

fn forward_params(shared: &WatchDogShared, proxy: &dyn TapedProxy) {
    let added = shared.params_to_add.drain();
    if !added.is_empty() {
        proxy.add_log_params(&shared.unit, &added);
    }
    let deleted = shared.params_to_delete.drain();
    if !deleted.is_empty() {
        proxy.delete_log_params(&shared.unit, &deleted);
    }
}
