//! Default values for configuration knobs, named so the rest of the crate never
//! hardcodes a bare literal for one of these.

pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TASKS_PER_CHILD: u32 = 1000;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SOFT_CANCEL_GRACE_SECS: u64 = 5;

pub const DEFAULT_RETRY_BASE_SECS: i64 = 60;
pub const DEFAULT_RETRY_MAX_SECS: i64 = 3600;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_QUEUE_WARNING_LENGTH: u64 = 100;
pub const DEFAULT_QUEUE_BLOCK_LENGTH: u64 = 10_000;

pub const DEFAULT_SCHEDULE_HOUR: u32 = 9;
pub const DEFAULT_SCHEDULE_MINUTE: u32 = 0;

/// Grounded on `workers/utils/alerting.py::_initialize_default_rules`.
pub const DEFAULT_ALERT_COOLDOWN_SECS: i64 = 900;
pub const HIGH_FAILURE_RATE_THRESHOLD: f64 = 0.10;
pub const CRITICAL_FAILURE_RATE_THRESHOLD: f64 = 0.25;
pub const HIGH_MEMORY_THRESHOLD: f64 = 0.90;
pub const HIGH_CPU_THRESHOLD: f64 = 0.90;
pub const QUEUE_BACKLOG_THRESHOLD: f64 = 100.0;
pub const HIGH_USAGE_ALERT_WINDOW_SECS: i64 = 300;

/// Grounded on `workers/utils/performance.py::self.thresholds`.
pub const PERF_CPU_HIGH: f64 = 0.7;
pub const PERF_CPU_LOW: f64 = 0.3;
pub const PERF_MEMORY_HIGH: f64 = 0.8;
pub const PERF_LOAD_FACTOR: f64 = 0.8;
pub const PERF_SCALE_DOWN: f64 = 0.8;
pub const PERF_SCALE_UP: f64 = 1.2;
pub const PERF_LOAD_SCALE_DOWN: f64 = 0.7;

/// Metrics ring-buffer capacities, grounded on `workers/utils/metrics.py`'s
/// `maxlen=10000` task history and `maxlen=1000` system-snapshot history.
pub const TASK_METRICS_HISTORY_CAPACITY: usize = 10_000;
pub const SYSTEM_METRICS_HISTORY_CAPACITY: usize = 1_000;

pub const TWILIO_SMS_MAX_CHARS: usize = 1500;

/// Max due tasks `process_due_ai_tasks` claims and fans out to per-task jobs in a
/// single Beat tick.
pub const DEFAULT_CLAIM_BATCH_LIMIT: u32 = 50;

/// Minimum retention window `cleanup_old_alerts` is called with, per the alerting
/// module's bounded-history requirement.
pub const DEFAULT_ALERT_HISTORY_MAX_AGE_HOURS: i64 = 168;

pub const QUEUE_NAMES: &[&str] = &[
    "ai_tasks",
    "email_tasks",
    "file_tasks",
    "sync_tasks",
    "maintenance_tasks",
];
