pub const METRIC_POOL_ACQUIRE_COUNT: &str = "tapeflow.pool.acquire.count";
pub const METRIC_POOL_ACQUIRE_WAIT_COUNT: &str = "tapeflow.pool.acquire.wait.count";
pub const METRIC_POOL_ACQUIRE_LATENCY_US: &str = "tapeflow.pool.acquire.latency_us";
pub const METRIC_POOL_RELEASE_COUNT: &str = "tapeflow.pool.release.count";
pub const METRIC_POOL_ALLOCATED_BYTES: &str = "tapeflow.pool.allocated_bytes";

pub const METRIC_WORKER_TASK_COUNT: &str = "tapeflow.worker.task.count";
pub const METRIC_WORKER_TASK_START_COUNT: &str = "tapeflow.worker.task.start.count";
pub const METRIC_WORKER_TASK_FINISH_COUNT: &str = "tapeflow.worker.task.finish.count";
pub const METRIC_WORKER_TASK_FAIL_COUNT: &str = "tapeflow.worker.task.fail.count";
pub const METRIC_WORKER_TASK_LATENCY_US: &str = "tapeflow.worker.task.latency_us";
pub const METRIC_WORKER_QUEUE_DEPTH: &str = "tapeflow.worker.queue.depth";
pub const METRIC_WORKER_ACTIVE_COUNT: &str = "tapeflow.worker.active.count";

pub const METRIC_TAPE_FILE_COUNT: &str = "tapeflow.tape.file.count";
pub const METRIC_TAPE_FILE_FAIL_COUNT: &str = "tapeflow.tape.file.fail.count";
pub const METRIC_TAPE_BYTES: &str = "tapeflow.tape.bytes";
pub const METRIC_TAPE_FLUSH_COUNT: &str = "tapeflow.tape.flush.count";
pub const METRIC_TAPE_FLUSH_LATENCY_US: &str = "tapeflow.tape.flush.latency_us";
pub const METRIC_TAPE_CLEANUP_COUNT: &str = "tapeflow.tape.cleanup.count";

pub const METRIC_REPORT_CLIENT_CALL_COUNT: &str = "tapeflow.report.client.call.count";
pub const METRIC_REPORT_CLIENT_FAILURE_COUNT: &str = "tapeflow.report.client.failure.count";
pub const METRIC_REPORT_FILES_OK_COUNT: &str = "tapeflow.report.files.ok.count";
pub const METRIC_REPORT_FILES_FAILED_COUNT: &str = "tapeflow.report.files.failed.count";
pub const METRIC_REPORT_END_SUBSTITUTED_COUNT: &str = "tapeflow.report.end.substituted.count";
pub const METRIC_REPORT_MISSED_COUNT: &str = "tapeflow.report.missed.count";

pub const METRIC_WATCHDOG_HEARTBEAT_COUNT: &str = "tapeflow.watchdog.heartbeat.count";
pub const METRIC_WATCHDOG_STUCK_COUNT: &str = "tapeflow.watchdog.stuck.count";
