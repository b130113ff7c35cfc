mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use support::{ClientCall, RecordingClient};
use tapeflow_core::recall::{DiskWriteTask, DiskWriteThreadPool};
use tapeflow_core::{
    BlockingQueue, CompletionLatch, DefaultWorkerTelemetry, DiskStats, LocalDisk,
    MemoryBlockPool, RecallFile, RecallReportPacker, SessionFault, WorkerPool, WorkerTelemetry,
};

#[derive(Default)]
struct CountingTelemetry {
    started: AtomicUsize,
    finished: AtomicUsize,
    failed: AtomicUsize,
}

impl WorkerTelemetry for CountingTelemetry {
    fn on_queue_depth(&self, _worker_id: usize, _depth: usize) {}

    fn on_task_started(&self, _worker_id: usize, _task_kind: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_task_finished(&self, _worker_id: usize, _task_kind: &str, _elapsed: Duration) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    fn on_task_failed(&self, _worker_id: usize, _task_kind: &str, _elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn workers_run_in_parallel_and_stats_are_summed() -> Result<(), Box<dyn std::error::Error>> {
    let telemetry = Arc::new(CountingTelemetry::default());
    let mut pool: WorkerPool<u64> = WorkerPool::new("test", "sleep", 4, telemetry.clone());
    let sink = pool.sink();
    let exits = Arc::new(AtomicUsize::new(0));
    let totals_seen = Arc::new(Mutex::new(None));

    let started = Instant::now();
    {
        let exits = Arc::clone(&exits);
        let totals_seen = Arc::clone(&totals_seen);
        pool.start(
            |_worker_id, millis, stats: &mut DiskStats| {
                thread::sleep(Duration::from_millis(millis));
                stats.files_count += 1;
                stats.data_volume += millis;
                true
            },
            |_remaining| {},
            move |totals| {
                exits.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut seen) = totals_seen.lock() {
                    *seen = Some(totals.clone());
                }
            },
        );
    }
    for millis in [10, 20, 30, 40] {
        sink.push(millis);
    }
    sink.finish();
    let totals = pool.wait()?;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(40));
    assert!(elapsed < Duration::from_millis(100 * 4));
    assert_eq!(totals.files_count, 4);
    assert_eq!(totals.data_volume, 100);
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert_eq!(
        totals_seen.lock().map_err(|_| "poisoned")?.as_ref(),
        Some(&totals)
    );
    assert_eq!(telemetry.started.load(Ordering::Relaxed), 4);
    assert_eq!(telemetry.finished.load(Ordering::Relaxed), 4);

    let snapshot = pool.runtime_snapshot();
    assert_eq!(snapshot.submitted, 4);
    assert_eq!(snapshot.completed, 4);
    assert_eq!(snapshot.active_workers, 0);
    Ok(())
}

#[test]
fn panicking_task_counts_as_failed_and_pool_keeps_going() -> Result<(), Box<dyn std::error::Error>>
{
    let telemetry = Arc::new(CountingTelemetry::default());
    let mut pool: WorkerPool<u32> = WorkerPool::new("test", "maybe_panic", 2, telemetry.clone());
    let sink = pool.sink();
    pool.start(
        |_worker_id, value, stats: &mut DiskStats| {
            if value == 3 {
                panic!("task {value} blew up");
            }
            stats.files_count += 1;
            value % 2 == 0
        },
        |_remaining| {},
        |_totals| {},
    );
    for value in 0..6 {
        sink.push(value);
    }
    sink.finish();
    let totals = pool.wait()?;

    assert_eq!(totals.files_count, 5);
    assert_eq!(telemetry.started.load(Ordering::Relaxed), 6);
    // 1 and 5 report failure, 3 panics.
    assert_eq!(telemetry.failed.load(Ordering::Relaxed), 3);
    assert_eq!(pool.runtime_snapshot().failed, 3);
    Ok(())
}

#[test]
fn last_disk_writer_ends_the_session_after_the_tape() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let client = RecordingClient::new();
    let mut packer = RecallReportPacker::new(client.boxed(), 10, Duration::from_millis(100));
    let blocks = MemoryBlockPool::new(8, 4)?;
    let tape_done = Arc::new(CompletionLatch::new());

    let mut disk = DiskWriteThreadPool::new(
        2,
        Arc::new(LocalDisk::new()),
        packer.sender(),
        Arc::new(SessionFault::new()),
        Arc::new(DefaultWorkerTelemetry),
    )
    .with_tape_latch(Arc::clone(&tape_done));

    let path = dir.path().join("f1");
    let fifo = Arc::new(BlockingQueue::new());
    let mut block = blocks.acquire();
    block.set_identity(1, 1, 0);
    block.append(b"tapeflow");
    block.mark_last();
    fifo.push(block);
    disk.push(DiskWriteTask::new(RecallFile::new(1, 1, 8, &path), fifo));
    disk.finish();

    packer.start_threads();
    disk.start_threads();
    thread::sleep(Duration::from_millis(30));
    // Nothing terminal until the tape side says it is done.
    assert!(client.terminal_calls().is_empty());

    tape_done.set();
    let stats = disk.wait_threads()?;
    let summary = packer.wait_threads()?;

    assert_eq!(stats.files_count, 1);
    assert_eq!(std::fs::read(&path)?, b"tapeflow");
    assert_eq!(summary.files_succeeded, 1);
    assert_eq!(client.terminal_calls(), vec![ClientCall::EndOfSession]);
    assert_eq!(blocks.free_blocks(), 4);
    Ok(())
}

#[test]
fn recorded_fault_ends_the_session_with_errors() -> Result<(), Box<dyn std::error::Error>> {
    let client = RecordingClient::new();
    let mut packer = RecallReportPacker::new(client.boxed(), 10, Duration::from_millis(100));
    let fault = Arc::new(SessionFault::new());
    fault.record("tape read failed", 5);

    let mut disk = DiskWriteThreadPool::new(
        1,
        Arc::new(LocalDisk::new()),
        packer.sender(),
        Arc::clone(&fault),
        Arc::new(DefaultWorkerTelemetry),
    );
    disk.finish();
    packer.start_threads();
    disk.start_threads();
    disk.wait_threads()?;
    packer.wait_threads()?;

    assert_eq!(
        client.terminal_calls(),
        vec![ClientCall::EndOfSessionWithError(
            "tape read failed".to_string(),
            5
        )]
    );
    Ok(())
}
