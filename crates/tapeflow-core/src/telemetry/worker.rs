use std::time::Duration;

use crate::telemetry;
use crate::telemetry::tags;

/// Hooks called by the disk worker pools around every task.
///
/// Pools take an `Arc<dyn WorkerTelemetry>` so tests and embedders can
/// observe worker activity without going through the global registry.
pub trait WorkerTelemetry: Send + Sync {
    fn on_queue_depth(&self, worker_id: usize, depth: usize);
    fn on_task_started(&self, worker_id: usize, task_kind: &str);
    fn on_task_finished(&self, worker_id: usize, task_kind: &str, elapsed: Duration);
    fn on_task_failed(&self, worker_id: usize, task_kind: &str, elapsed: Duration);
}

/// Forwards worker activity to the process-wide metrics registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWorkerTelemetry;

impl WorkerTelemetry for DefaultWorkerTelemetry {
    fn on_queue_depth(&self, _worker_id: usize, depth: usize) {
        telemetry::set_gauge(
            tags::METRIC_WORKER_QUEUE_DEPTH,
            depth as u64,
            &[("subsystem", "worker"), ("op", "queue_depth")],
        );
    }

    fn on_task_started(&self, _worker_id: usize, task_kind: &str) {
        telemetry::increment_counter(
            tags::METRIC_WORKER_TASK_START_COUNT,
            1,
            &[("subsystem", "worker"), ("op", "task_start"), ("kind", task_kind)],
        );
        telemetry::add_gauge(
            tags::METRIC_WORKER_ACTIVE_COUNT,
            1,
            &[("subsystem", "worker"), ("op", "task_start")],
        );
    }

    fn on_task_finished(&self, worker_id: usize, task_kind: &str, elapsed: Duration) {
        record_task_end(tags::METRIC_WORKER_TASK_FINISH_COUNT, "ok", task_kind, elapsed);
        tracing::trace!(
            worker_id,
            task_kind,
            elapsed_us = elapsed.as_micros() as u64,
            "disk task finished"
        );
    }

    fn on_task_failed(&self, worker_id: usize, task_kind: &str, elapsed: Duration) {
        record_task_end(tags::METRIC_WORKER_TASK_FAIL_COUNT, "error", task_kind, elapsed);
        tracing::debug!(
            worker_id,
            task_kind,
            elapsed_us = elapsed.as_micros() as u64,
            "disk task failed"
        );
    }
}

fn record_task_end(counter: &'static str, result: &str, task_kind: &str, elapsed: Duration) {
    let elapsed_us = elapsed.as_micros().min(u64::MAX as u128) as u64;
    let labels = [
        ("subsystem", "worker"),
        ("op", "task"),
        ("kind", task_kind),
        ("result", result),
    ];
    telemetry::increment_counter(counter, 1, &labels);
    telemetry::increment_counter(tags::METRIC_WORKER_TASK_COUNT, 1, &labels);
    telemetry::record_histogram(tags::METRIC_WORKER_TASK_LATENCY_US, elapsed_us, &labels);
    telemetry::sub_gauge_saturating(
        tags::METRIC_WORKER_ACTIVE_COUNT,
        1,
        &[("subsystem", "worker"), ("op", "task_end")],
    );
}
