use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::queue::{BlockingQueue, ValueRemaining};
use crate::core::sync::{lock_unpoisoned, panic_details};
use crate::error::TapeflowError;
use crate::stats::DiskStats;
use crate::telemetry::worker::WorkerTelemetry;
use crate::types::Result;

/// Producer side of a [`WorkerPool`] queue.
pub struct TaskSink<T> {
    queue: Arc<BlockingQueue<Option<T>>>,
    workers: usize,
    finished: Arc<AtomicBool>,
    submitted: Arc<AtomicUsize>,
}

impl<T> Clone for TaskSink<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            workers: self.workers,
            finished: Arc::clone(&self.finished),
            submitted: Arc::clone(&self.submitted),
        }
    }
}

impl<T> TaskSink<T> {
    pub fn push(&self, task: T) {
        if self.finished.load(Ordering::Acquire) {
            tracing::error!("task pushed after the pool was told no more tasks would come");
        }
        self.submitted.fetch_add(1, Ordering::AcqRel);
        self.queue.push(Some(task));
    }

    /// Tells the pool no more tasks will arrive: one end marker per worker.
    /// Only the first call has an effect.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.workers {
            self.queue.push(None);
        }
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Acquire)
    }

    /// Items queued and not yet picked up, end markers included.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

struct WorkerPoolState {
    telemetry: Arc<dyn WorkerTelemetry>,
    started_at: Instant,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    task_counts: Vec<AtomicUsize>,
    worker_started_offsets_us: Vec<AtomicU64>,
    worker_stopped_offsets_us: Vec<AtomicU64>,
    worker_busy_us: Vec<AtomicU64>,
    stats: Mutex<DiskStats>,
}

impl WorkerPoolState {
    fn new(telemetry: Arc<dyn WorkerTelemetry>, num_workers: usize) -> Self {
        let counters = || -> Vec<AtomicU64> {
            (0..num_workers).map(|_| AtomicU64::new(0)).collect()
        };
        Self {
            telemetry,
            started_at: Instant::now(),
            active: AtomicUsize::new(num_workers),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            task_counts: (0..num_workers).map(|_| AtomicUsize::new(0)).collect(),
            worker_started_offsets_us: counters(),
            worker_stopped_offsets_us: counters(),
            worker_busy_us: counters(),
            stats: Mutex::new(DiskStats::default()),
        }
    }

    fn elapsed_us(&self) -> u64 {
        self.started_at.elapsed().as_micros().min(u64::MAX as u128) as u64
    }
}

/// Per-worker runtime metrics captured by the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeSnapshot {
    pub worker_id: usize,
    pub tasks_completed: usize,
    pub uptime: Duration,
    pub busy: Duration,
    pub idle: Duration,
    pub utilization: f64,
}

/// Runtime metrics snapshot for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolRuntimeSnapshot {
    pub elapsed: Duration,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub active_workers: usize,
    pub workers: Vec<WorkerRuntimeSnapshot>,
}

/// Fixed set of disk worker threads draining a shared task queue.
///
/// Workers stop when they pop an end marker. Each worker folds its
/// [`DiskStats`] into the pool total on exit, and the last one to leave
/// runs the pool's exit hook with the final totals.
pub struct WorkerPool<T: Send + 'static> {
    name: &'static str,
    task_kind: &'static str,
    num_workers: usize,
    sink: TaskSink<T>,
    telemetry: Arc<dyn WorkerTelemetry>,
    state: Option<Arc<WorkerPoolState>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(
        name: &'static str,
        task_kind: &'static str,
        num_workers: usize,
        telemetry: Arc<dyn WorkerTelemetry>,
    ) -> Self {
        let workers = num_workers.max(1);
        Self {
            name,
            task_kind,
            num_workers: workers,
            sink: TaskSink {
                queue: Arc::new(BlockingQueue::new()),
                workers,
                finished: Arc::new(AtomicBool::new(false)),
                submitted: Arc::new(AtomicUsize::new(0)),
            },
            telemetry,
            state: None,
            handles: Vec::new(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn sink(&self) -> TaskSink<T> {
        self.sink.clone()
    }

    /// Spawns the workers.
    ///
    /// `processor` runs one task and returns whether it succeeded,
    /// `on_pop` sees the queue depth left after every pop, and `on_last_exit`
    /// runs once, on the last worker to stop, with the summed statistics.
    pub fn start<F, P, L>(&mut self, processor: F, on_pop: P, on_last_exit: L)
    where
        F: Fn(usize, T, &mut DiskStats) -> bool + Send + Sync + 'static,
        P: Fn(usize) + Send + Sync + 'static,
        L: FnOnce(&DiskStats) + Send + 'static,
    {
        if self.state.is_some() {
            tracing::warn!(pool = self.name, "worker pool already started");
            return;
        }
        let state = Arc::new(WorkerPoolState::new(
            Arc::clone(&self.telemetry),
            self.num_workers,
        ));
        let processor = Arc::new(processor);
        let on_pop = Arc::new(on_pop);
        let on_last_exit = Arc::new(Mutex::new(Some(on_last_exit)));

        for worker_id in 0..self.num_workers {
            let worker = Worker {
                id: worker_id,
                pool_name: self.name,
                task_kind: self.task_kind,
                queue: Arc::clone(&self.sink.queue),
                state: Arc::clone(&state),
            };
            let processor = Arc::clone(&processor);
            let on_pop = Arc::clone(&on_pop);
            let on_last_exit = Arc::clone(&on_last_exit);
            self.handles.push(thread::spawn(move || {
                worker.run(processor.as_ref(), on_pop.as_ref(), &on_last_exit);
            }));
        }
        self.state = Some(state);
    }

    /// Joins every worker and returns the summed statistics.
    pub fn wait(&mut self) -> Result<DiskStats> {
        let mut first_panic = None;
        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                first_panic.get_or_insert_with(|| panic_details(payload.as_ref()));
            }
        }
        if let Some(details) = first_panic {
            return Err(TapeflowError::Other(anyhow::anyhow!(
                "{} worker thread panicked: {details}",
                self.name
            )));
        }
        Ok(self
            .state
            .as_ref()
            .map(|state| lock_unpoisoned(&state.stats).clone())
            .unwrap_or_default())
    }

    pub fn runtime_snapshot(&self) -> PoolRuntimeSnapshot {
        let Some(state) = self.state.as_ref() else {
            return PoolRuntimeSnapshot {
                elapsed: Duration::ZERO,
                submitted: self.sink.submitted(),
                completed: 0,
                failed: 0,
                active_workers: 0,
                workers: Vec::new(),
            };
        };
        let elapsed = state.started_at.elapsed();
        let elapsed_us = elapsed.as_micros().min(u64::MAX as u128) as u64;

        let workers = (0..state.task_counts.len())
            .map(|worker_id| {
                let started_raw =
                    state.worker_started_offsets_us[worker_id].load(Ordering::Acquire);
                let stopped_raw =
                    state.worker_stopped_offsets_us[worker_id].load(Ordering::Acquire);
                let stop_us = if stopped_raw == 0 {
                    elapsed_us
                } else {
                    stopped_raw.saturating_sub(1)
                };
                let uptime_us = if started_raw == 0 {
                    0
                } else {
                    stop_us.saturating_sub(started_raw.saturating_sub(1))
                };
                let busy_us = state.worker_busy_us[worker_id]
                    .load(Ordering::Acquire)
                    .min(uptime_us);
                WorkerRuntimeSnapshot {
                    worker_id,
                    tasks_completed: state.task_counts[worker_id].load(Ordering::Acquire),
                    uptime: Duration::from_micros(uptime_us),
                    busy: Duration::from_micros(busy_us),
                    idle: Duration::from_micros(uptime_us - busy_us),
                    utilization: if uptime_us == 0 {
                        0.0
                    } else {
                        busy_us as f64 / uptime_us as f64
                    },
                }
            })
            .collect();

        PoolRuntimeSnapshot {
            elapsed,
            submitted: self.sink.submitted(),
            completed: state.completed.load(Ordering::Acquire),
            failed: state.failed.load(Ordering::Acquire),
            active_workers: state.active.load(Ordering::Acquire),
            workers,
        }
    }
}

type ExitHook<L> = Arc<Mutex<Option<L>>>;

struct Worker<T> {
    id: usize,
    pool_name: &'static str,
    task_kind: &'static str,
    queue: Arc<BlockingQueue<Option<T>>>,
    state: Arc<WorkerPoolState>,
}

impl<T> Worker<T> {
    fn run<F, P, L>(self, processor: &F, on_pop: &P, on_last_exit: &ExitHook<L>)
    where
        F: Fn(usize, T, &mut DiskStats) -> bool,
        P: Fn(usize),
        L: FnOnce(&DiskStats),
    {
        let state = &self.state;
        state.worker_started_offsets_us[self.id]
            .store(state.elapsed_us().saturating_add(1), Ordering::Release);
        let mut local = DiskStats::default();

        loop {
            let ValueRemaining { value, remaining } = self.queue.pop_with_remaining();
            state.telemetry.on_queue_depth(self.id, remaining);
            on_pop(remaining);
            let Some(task) = value else {
                break;
            };

            state.telemetry.on_task_started(self.id, self.task_kind);
            let started_at = Instant::now();
            let succeeded = match catch_unwind(AssertUnwindSafe(|| {
                processor(self.id, task, &mut local)
            })) {
                Ok(succeeded) => succeeded,
                Err(payload) => {
                    tracing::error!(
                        pool = self.pool_name,
                        worker_id = self.id,
                        details = %panic_details(payload.as_ref()),
                        "disk task panicked"
                    );
                    false
                }
            };
            let elapsed = started_at.elapsed();
            state.worker_busy_us[self.id].fetch_add(
                elapsed.as_micros().min(u64::MAX as u128) as u64,
                Ordering::AcqRel,
            );
            if succeeded {
                state.telemetry.on_task_finished(self.id, self.task_kind, elapsed);
            } else {
                state.failed.fetch_add(1, Ordering::AcqRel);
                state.telemetry.on_task_failed(self.id, self.task_kind, elapsed);
            }
            state.completed.fetch_add(1, Ordering::AcqRel);
            state.task_counts[self.id].fetch_add(1, Ordering::AcqRel);
        }

        lock_unpoisoned(&state.stats).add(&local);
        state.worker_stopped_offsets_us[self.id]
            .store(state.elapsed_us().saturating_add(1), Ordering::Release);
        tracing::debug!(pool = self.pool_name, worker_id = self.id, "disk worker finished");

        if state.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            let totals = lock_unpoisoned(&state.stats).clone();
            if let Some(hook) = lock_unpoisoned(on_last_exit).take() {
                hook(&totals);
            }
        }
    }
}
