//! Resource-usage sampling, trend analysis, and adaptive worker-concurrency tuning.
//!
//! Grounded on `workers/utils/performance.py::PerformanceOptimizer`: the exact
//! threshold-driven tuning rules in `optimize_worker_configuration`'s `self.thresholds`
//! dict, the least-squares linear trend used by both `_calculate_trends` and
//! `get_resource_forecast`, and the sample-count confidence tiers.

use chrono::{DateTime, Utc};
use scheduler_core::defaults::*;
use std::collections::HashMap;
use std::sync::Mutex;

/// One resource-usage sample.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub timestamp_secs: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub load_average: f64,
}

/// Slope/intercept of a least-squares fit over an index-as-x series, plus a
/// human-readable direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

const TREND_STABLE_THRESHOLD: f64 = 0.01;

/// Least-squares slope/intercept of `values` against their index.
fn linear_trend(values: &[f64]) -> Trend {
    let n = values.len() as f64;
    if values.len() < 2 {
        return Trend {
            slope: 0.0,
            intercept: values.first().copied().unwrap_or(0.0),
            direction: TrendDirection::Stable,
        };
    }
    let xs: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = values.iter().sum::<f64>() / n;
    let numerator: f64 = xs
        .iter()
        .zip(values.iter())
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let denominator: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    let slope = if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        numerator / denominator
    };
    let intercept = mean_y - slope * mean_x;
    let direction = if slope > TREND_STABLE_THRESHOLD {
        TrendDirection::Increasing
    } else if slope < -TREND_STABLE_THRESHOLD {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };
    Trend {
        slope,
        intercept,
        direction,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastConfidence {
    Low,
    Medium,
    High,
}

fn forecast_confidence(sample_count: usize) -> ForecastConfidence {
    if sample_count < 10 {
        ForecastConfidence::Low
    } else if sample_count < 50 {
        ForecastConfidence::Medium
    } else {
        ForecastConfidence::High
    }
}

/// Per-queue, per-resource worker tuning. Mirrors the five named queues the teacher's
/// `optimize_worker_configuration` iterates over.
#[derive(Debug, Clone)]
pub struct WorkerConfiguration {
    pub queue_concurrency: HashMap<String, u32>,
    pub worker_max_memory_mb: Option<u32>,
}

pub struct PerformanceOptimizer {
    samples: Mutex<Vec<ResourceSample>>,
    cpu_cores: u32,
    total_memory_gb: f64,
    capacity: usize,
}

const DEFAULT_CAPACITY: usize = 1_000;
const FORECAST_SAMPLE_WINDOW: usize = 100;

impl PerformanceOptimizer {
    pub fn new(cpu_cores: u32, total_memory_gb: f64) -> Self {
        PerformanceOptimizer {
            samples: Mutex::new(Vec::new()),
            cpu_cores,
            total_memory_gb,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn record_sample(&self, sample: ResourceSample) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() >= self.capacity {
            samples.remove(0);
        }
        samples.push(sample);
    }

    pub fn analyze(&self, window: usize) -> HashMap<&'static str, Trend> {
        let samples = self.samples.lock().unwrap();
        let recent: Vec<&ResourceSample> = samples.iter().rev().take(window).collect();
        let cpu: Vec<f64> = recent.iter().rev().map(|s| s.cpu_percent).collect();
        let memory: Vec<f64> = recent.iter().rev().map(|s| s.memory_percent).collect();
        let mut trends = HashMap::new();
        trends.insert("cpu_percent", linear_trend(&cpu));
        trends.insert("memory_percent", linear_trend(&memory));
        trends
    }

    /// Mutates `current` in place per SPEC_FULL §4.8's four threshold rules, applied in
    /// the same order the teacher's implementation does.
    pub fn optimize_worker_configuration(&self, mut current: WorkerConfiguration, avg_load: f64) -> WorkerConfiguration {
        let samples = self.samples.lock().unwrap();
        let Some(latest) = samples.last().copied() else {
            return current;
        };
        drop(samples);

        if latest.cpu_percent > PERF_CPU_HIGH {
            for (_, concurrency) in current.queue_concurrency.iter_mut() {
                *concurrency = ((*concurrency as f64 * PERF_SCALE_DOWN) as u32).max(1);
            }
        } else if latest.cpu_percent < PERF_CPU_LOW {
            let cap = self.cpu_cores * 2;
            for (_, concurrency) in current.queue_concurrency.iter_mut() {
                *concurrency = (((*concurrency as f64) * PERF_SCALE_UP) as u32).min(cap).max(1);
            }
        }

        if latest.memory_percent > PERF_MEMORY_HIGH {
            current.worker_max_memory_mb = Some((self.total_memory_gb * 1024.0 * 0.6) as u32);
        }

        if avg_load > (self.cpu_cores as f64) * PERF_LOAD_FACTOR {
            for (_, concurrency) in current.queue_concurrency.iter_mut() {
                *concurrency = ((*concurrency as f64 * PERF_LOAD_SCALE_DOWN) as u32).max(1);
            }
        }

        current
    }

    /// Linear projection of the trailing `FORECAST_SAMPLE_WINDOW` samples, one point
    /// per hour up to `hours`, clamped to `[0, 100]`.
    pub fn forecast(&self, hours: u32) -> Vec<(f64, f64, ForecastConfidence)> {
        let samples = self.samples.lock().unwrap();
        let recent: Vec<&ResourceSample> = samples
            .iter()
            .rev()
            .take(FORECAST_SAMPLE_WINDOW)
            .collect();
        let sample_count = recent.len();
        let cpu: Vec<f64> = recent.iter().rev().map(|s| s.cpu_percent).collect();
        let memory: Vec<f64> = recent.iter().rev().map(|s| s.memory_percent).collect();
        drop(samples);

        let cpu_trend = linear_trend(&cpu);
        let mem_trend = linear_trend(&memory);
        let confidence = forecast_confidence(sample_count);

        (1..=hours.min(24))
            .map(|h| {
                let x = sample_count as f64 + h as f64;
                let cpu_pred = (cpu_trend.slope * x + cpu_trend.intercept).clamp(0.0, 100.0);
                let mem_pred = (mem_trend.slope * x + mem_trend.intercept).clamp(0.0, 100.0);
                (cpu_pred, mem_pred, confidence)
            })
            .collect()
    }

    pub fn sample_timestamp(now: DateTime<Utc>) -> i64 {
        now.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(concurrency: u32) -> WorkerConfiguration {
        let mut queue_concurrency = HashMap::new();
        for name in QUEUE_NAMES {
            queue_concurrency.insert(name.to_string(), concurrency);
        }
        WorkerConfiguration {
            queue_concurrency,
            worker_max_memory_mb: None,
        }
    }

    #[test]
    fn high_cpu_scales_concurrency_down() {
        let optimizer = PerformanceOptimizer::new(4, 16.0);
        optimizer.record_sample(ResourceSample {
            timestamp_secs: 0,
            cpu_percent: 0.9,
            memory_percent: 0.3,
            load_average: 1.0,
        });
        let tuned = optimizer.optimize_worker_configuration(config(10), 1.0);
        assert_eq!(tuned.queue_concurrency["ai_tasks"], 8);
    }

    #[test]
    fn low_cpu_scales_concurrency_up_but_caps_at_double_cores() {
        let optimizer = PerformanceOptimizer::new(4, 16.0);
        optimizer.record_sample(ResourceSample {
            timestamp_secs: 0,
            cpu_percent: 0.1,
            memory_percent: 0.3,
            load_average: 1.0,
        });
        let tuned = optimizer.optimize_worker_configuration(config(10), 1.0);
        assert_eq!(tuned.queue_concurrency["ai_tasks"], 8, "10 * 1.2 = 12 capped at 2*4=8");
    }

    #[test]
    fn high_memory_caps_worker_memory_at_sixty_percent() {
        let optimizer = PerformanceOptimizer::new(4, 16.0);
        optimizer.record_sample(ResourceSample {
            timestamp_secs: 0,
            cpu_percent: 0.5,
            memory_percent: 0.95,
            load_average: 1.0,
        });
        let tuned = optimizer.optimize_worker_configuration(config(10), 1.0);
        assert_eq!(tuned.worker_max_memory_mb, Some((16.0 * 1024.0 * 0.6) as u32));
    }

    #[test]
    fn forecast_confidence_tracks_sample_count() {
        assert_eq!(forecast_confidence(5), ForecastConfidence::Low);
        assert_eq!(forecast_confidence(20), ForecastConfidence::Medium);
        assert_eq!(forecast_confidence(60), ForecastConfidence::High);
    }

    #[test]
    fn linear_trend_detects_increasing_direction() {
        let trend = linear_trend(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(trend.direction, TrendDirection::Increasing);
        assert!(trend.slope > 0.0);
    }
}
