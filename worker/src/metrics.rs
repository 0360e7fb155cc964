//! Per-task timing/resource samples, rolling percentiles, and system snapshots.
//!
//! Grounded on `workers/utils/metrics.py::MetricsCollector`: ring buffers capped at
//! 10,000 task records and 1,000 system snapshots, and the exact percentile formula
//! (`sorted[count * p]` for p in {0.5, 0.9, 0.95, 0.99}). The original's
//! `get_current_system_status` hardcoded `queue_lengths = {"ai_tasks": 0}`; this
//! collector instead samples real lengths through the injected `SystemProbe` port, per
//! SPEC_FULL §9's redesign note.

use chrono::{DateTime, Utc};
use scheduler_core::defaults::{SYSTEM_METRICS_HISTORY_CAPACITY, TASK_METRICS_HISTORY_CAPACITY};
use scheduler_core::model::{SystemMetrics, TaskMetrics};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Abstract resource-sampling port. One adapter per OS/environment; tests use a fake
/// that returns deterministic numbers, matching SPEC_FULL §9's hermetic-testing note.
pub trait SystemProbe: Send + Sync {
    fn cpu_percent(&self) -> f64;
    fn memory_percent(&self) -> f64;
    fn memory_available_gb(&self) -> f64;
    fn disk_usage_percent(&self) -> f64;
    fn network_bytes(&self) -> (u64, u64);
    fn active_connections(&self) -> u64;
}

/// A `SystemProbe` that always reports fixed values, for tests and for platforms where
/// no real sampler is wired up yet.
pub struct FixedSystemProbe {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_gb: f64,
    pub disk_usage_percent: f64,
}

impl Default for FixedSystemProbe {
    fn default() -> Self {
        FixedSystemProbe {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_available_gb: 0.0,
            disk_usage_percent: 0.0,
        }
    }
}

impl SystemProbe for FixedSystemProbe {
    fn cpu_percent(&self) -> f64 {
        self.cpu_percent
    }
    fn memory_percent(&self) -> f64 {
        self.memory_percent
    }
    fn memory_available_gb(&self) -> f64 {
        self.memory_available_gb
    }
    fn disk_usage_percent(&self) -> f64 {
        self.disk_usage_percent
    }
    fn network_bytes(&self) -> (u64, u64) {
        (0, 0)
    }
    fn active_connections(&self) -> u64 {
        0
    }
}

/// Percentile/aggregate summary for one `task_name`'s execution times.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSummary {
    pub count: usize,
    pub total: f64,
    pub average: f64,
    pub minimum: f64,
    pub maximum: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub standard_deviation: f64,
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * p) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn summarize(mut times: Vec<f64>) -> PerformanceSummary {
    times.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = times.len();
    let total: f64 = times.iter().sum();
    let average = if count > 0 { total / count as f64 } else { 0.0 };
    let variance = if count > 0 {
        times.iter().map(|t| (t - average).powi(2)).sum::<f64>() / count as f64
    } else {
        0.0
    };
    PerformanceSummary {
        count,
        total,
        average,
        minimum: times.first().copied().unwrap_or(0.0),
        maximum: times.last().copied().unwrap_or(0.0),
        p50: percentile(&times, 0.5),
        p90: percentile(&times, 0.9),
        p95: percentile(&times, 0.95),
        p99: percentile(&times, 0.99),
        standard_deviation: variance.sqrt(),
    }
}

struct Inner {
    task_history: VecDeque<TaskMetrics>,
    execution_times: HashMap<String, VecDeque<f64>>,
    system_history: VecDeque<SystemMetrics>,
    open: HashMap<String, TaskMetrics>,
}

/// Thread-safe metrics store: every mutating method is serialised via a single mutex;
/// summaries are computed on a cloned copy of the series outside the lock.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    probe: Box<dyn SystemProbe>,
}

impl MetricsCollector {
    pub fn new(probe: Box<dyn SystemProbe>) -> Self {
        MetricsCollector {
            inner: Mutex::new(Inner {
                task_history: VecDeque::new(),
                execution_times: HashMap::new(),
                system_history: VecDeque::new(),
                open: HashMap::new(),
            }),
            probe,
        }
    }

    pub fn start(
        &self,
        task_id: &str,
        task_name: &str,
        queue_name: Option<&str>,
        priority: Option<i32>,
        worker_id: Option<&str>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.open.insert(
            task_id.to_string(),
            TaskMetrics {
                task_id: task_id.to_string(),
                task_name: task_name.to_string(),
                start_time: Utc::now(),
                end_time: None,
                execution_time_secs: None,
                cpu_percent_start: Some(self.probe.cpu_percent()),
                cpu_percent_end: None,
                cpu_percent_peak: Some(self.probe.cpu_percent()),
                memory_percent_start: Some(self.probe.memory_percent()),
                memory_percent_end: None,
                memory_percent_peak: Some(self.probe.memory_percent()),
                status: "running".to_string(),
                error: None,
                retry_count: 0,
                queue_time_secs: None,
                worker_id: worker_id.map(|s| s.to_string()),
                queue_name: queue_name.map(|s| s.to_string()),
                priority,
            },
        );
    }

    pub fn end(&self, task_id: &str, status: &str, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut record) = inner.open.remove(task_id) else {
            return;
        };
        let now = Utc::now();
        record.end_time = Some(now);
        record.execution_time_secs = Some((now - record.start_time).num_milliseconds() as f64 / 1000.0);
        let cpu_end = self.probe.cpu_percent();
        let mem_end = self.probe.memory_percent();
        record.cpu_percent_end = Some(cpu_end);
        record.cpu_percent_peak = Some(cpu_end.max(record.cpu_percent_peak.unwrap_or(0.0)));
        record.memory_percent_end = Some(mem_end);
        record.memory_percent_peak = Some(mem_end.max(record.memory_percent_peak.unwrap_or(0.0)));
        record.status = status.to_string();
        record.error = error;

        let times = inner
            .execution_times
            .entry(record.task_name.clone())
            .or_insert_with(VecDeque::new);
        if let Some(t) = record.execution_time_secs {
            if times.len() >= TASK_METRICS_HISTORY_CAPACITY {
                times.pop_front();
            }
            times.push_back(t);
        }

        if inner.task_history.len() >= TASK_METRICS_HISTORY_CAPACITY {
            inner.task_history.pop_front();
        }
        inner.task_history.push_back(record);
    }

    pub fn performance_summary(&self, task_name: &str) -> PerformanceSummary {
        let inner = self.inner.lock().unwrap();
        let times = inner
            .execution_times
            .get(task_name)
            .map(|d| d.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        drop(inner);
        summarize(times)
    }

    pub fn record_system_snapshot(&self, worker_count: u32, queue_lengths: HashMap<String, u64>) {
        let snapshot = SystemMetrics {
            timestamp: Utc::now(),
            cpu_percent: self.probe.cpu_percent(),
            memory_percent: self.probe.memory_percent(),
            memory_available_gb: self.probe.memory_available_gb(),
            disk_usage_percent: self.probe.disk_usage_percent(),
            network_bytes_sent: self.probe.network_bytes().0,
            network_bytes_recv: self.probe.network_bytes().1,
            active_connections: self.probe.active_connections(),
            worker_count,
            queue_lengths,
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.system_history.len() >= SYSTEM_METRICS_HISTORY_CAPACITY {
            inner.system_history.pop_front();
        }
        inner.system_history.push_back(snapshot);
    }

    pub fn current_system_status(&self) -> Option<SystemMetrics> {
        let inner = self.inner.lock().unwrap();
        inner.system_history.back().cloned()
    }

    pub fn system_history(&self) -> Vec<SystemMetrics> {
        let inner = self.inner.lock().unwrap();
        inner.system_history.iter().cloned().collect()
    }

    /// Failure rate over the most recent `window` task records for `task_name`,
    /// feeding `AlertManager`'s failure-rate rules.
    pub fn recent_failure_rate(&self, task_name: &str, window: usize) -> f64 {
        let inner = self.inner.lock().unwrap();
        let recent: Vec<&TaskMetrics> = inner
            .task_history
            .iter()
            .filter(|m| m.task_name == task_name)
            .rev()
            .take(window)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let failed = recent.iter().filter(|m| m.status == "failed").count();
        failed as f64 / recent.len() as f64
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.inner.lock().unwrap().task_history.len()
    }

    #[cfg(test)]
    fn last_task_record(&self) -> TaskMetrics {
        self.inner.lock().unwrap().task_history.back().cloned().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_end_records_a_completed_task() {
        let collector = MetricsCollector::new(Box::new(FixedSystemProbe::default()));
        collector.start("t1", "process_due_ai_tasks", Some("ai_tasks"), Some(10), Some("worker-0-slot0"));
        collector.end("t1", "completed", None);
        assert_eq!(collector.history_len(), 1);
        let summary = collector.performance_summary("process_due_ai_tasks");
        assert_eq!(summary.count, 1);
    }

    #[test]
    fn start_records_the_worker_id() {
        let collector = MetricsCollector::new(Box::new(FixedSystemProbe::default()));
        collector.start("t1", "process_due_ai_tasks", Some("ai_tasks"), Some(10), Some("worker-0-slot0"));
        collector.end("t1", "completed", None);
        assert_eq!(collector.last_task_record().worker_id.as_deref(), Some("worker-0-slot0"));
    }

    #[test]
    fn percentiles_match_the_sorted_index_formula() {
        let times: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        let summary = summarize(times);
        assert_eq!(summary.p50, 51.0);
        assert_eq!(summary.p99, 100.0);
    }

    #[test]
    fn failure_rate_is_computed_over_the_trailing_window() {
        let collector = MetricsCollector::new(Box::new(FixedSystemProbe::default()));
        for i in 0..4 {
            collector.start(&format!("t{i}"), "send_email", None, None, None);
            let status = if i < 1 { "failed" } else { "completed" };
            collector.end(&format!("t{i}"), status, None);
        }
        let rate = collector.recent_failure_rate("send_email", 10);
        assert_eq!(rate, 0.25);
    }

    #[test]
    fn system_snapshot_reports_real_queue_lengths() {
        let collector = MetricsCollector::new(Box::new(FixedSystemProbe::default()));
        let mut lengths = HashMap::new();
        lengths.insert("ai_tasks".to_string(), 42u64);
        collector.record_system_snapshot(3, lengths);
        let status = collector.current_system_status().unwrap();
        assert_eq!(status.queue_lengths.get("ai_tasks"), Some(&42));
    }
}
