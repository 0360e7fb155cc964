//! `GET /health` — the contract consumers poll per SPEC_FULL §6.

use axum::{routing::get, Json, Router};
use scheduler_core::broker::Broker;
use scheduler_core::defaults::QUEUE_NAMES;
use scheduler_worker::performance::{ForecastConfidence, PerformanceOptimizer, TrendDirection};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Trailing-sample window `PerformanceOptimizer::analyze` is asked to summarise for the
/// health response; small enough to stay cheap on every poll.
const HEALTH_TREND_WINDOW: usize = 20;

#[derive(Clone)]
pub struct HealthState {
    pub broker: Arc<dyn Broker>,
    pub performance: Arc<PerformanceOptimizer>,
    /// blake3 hash of the effective `Config`, so operators can confirm every instance in
    /// a deployment is running identical configuration.
    pub config_checksum: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Error,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub queue_lengths: std::collections::HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum TrendLabel {
    Increasing,
    Decreasing,
    Stable,
}

impl From<TrendDirection> for TrendLabel {
    fn from(direction: TrendDirection) -> Self {
        match direction {
            TrendDirection::Increasing => TrendLabel::Increasing,
            TrendDirection::Decreasing => TrendLabel::Decreasing,
            TrendDirection::Stable => TrendLabel::Stable,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ConfidenceLabel {
    Low,
    Medium,
    High,
}

impl From<ForecastConfidence> for ConfidenceLabel {
    fn from(confidence: ForecastConfidence) -> Self {
        match confidence {
            ForecastConfidence::Low => ConfidenceLabel::Low,
            ForecastConfidence::Medium => ConfidenceLabel::Medium,
            ForecastConfidence::High => ConfidenceLabel::High,
        }
    }
}

/// CPU/memory trend over the trailing window plus the confidence of the next-hour
/// forecast, sourced from `PerformanceOptimizer::analyze`/`forecast`.
#[derive(Debug, Serialize)]
pub struct PerformanceReport {
    pub cpu_trend: TrendLabel,
    pub memory_trend: TrendLabel,
    pub forecast_confidence: ConfidenceLabel,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub response_time_ms: u128,
    pub pool_stats: PoolStats,
    pub performance: PerformanceReport,
    pub config_checksum: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(move || health_handler(state.clone())))
}

fn performance_report(performance: &PerformanceOptimizer) -> PerformanceReport {
    let trends = performance.analyze(HEALTH_TREND_WINDOW);
    let cpu_trend = trends
        .get("cpu_percent")
        .map(|t| t.direction)
        .unwrap_or(TrendDirection::Stable)
        .into();
    let memory_trend = trends
        .get("memory_percent")
        .map(|t| t.direction)
        .unwrap_or(TrendDirection::Stable)
        .into();
    let forecast_confidence = performance
        .forecast(1)
        .first()
        .map(|(_, _, confidence)| *confidence)
        .unwrap_or(ForecastConfidence::Low)
        .into();
    PerformanceReport {
        cpu_trend,
        memory_trend,
        forecast_confidence,
    }
}

async fn health_handler(state: HealthState) -> Json<HealthResponse> {
    let probe_start = Instant::now();
    let mut queue_lengths = std::collections::HashMap::new();
    let mut status = HealthStatus::Healthy;

    for queue in QUEUE_NAMES {
        match state.broker.queue_len(queue) {
            Ok(len) => {
                queue_lengths.insert(queue.to_string(), len);
                if len > scheduler_core::defaults::DEFAULT_QUEUE_BLOCK_LENGTH {
                    status = HealthStatus::Unhealthy;
                } else if len > scheduler_core::defaults::DEFAULT_QUEUE_WARNING_LENGTH
                    && matches!(status, HealthStatus::Healthy)
                {
                    status = HealthStatus::Degraded;
                }
            }
            Err(_) => {
                status = HealthStatus::Error;
            }
        }
    }

    Json(HealthResponse {
        status,
        response_time_ms: probe_start.elapsed().as_millis(),
        pool_stats: PoolStats { queue_lengths },
        performance: performance_report(&state.performance),
        config_checksum: state.config_checksum.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_performance() -> Arc<PerformanceOptimizer> {
        Arc::new(PerformanceOptimizer::new(4, 16.0))
    }

    #[tokio::test]
    async fn healthy_when_every_queue_is_below_the_warning_threshold() {
        let broker: Arc<dyn Broker> = Arc::new(scheduler_core::broker::SqliteBroker::open_in_memory().unwrap());
        let state = HealthState {
            broker,
            performance: test_performance(),
            config_checksum: "deadbeef".to_string(),
        };
        let response = health_handler(state).await;
        assert!(matches!(response.0.status, HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn degrades_when_a_queue_passes_the_warning_threshold() {
        let broker = Arc::new(scheduler_core::broker::SqliteBroker::open_in_memory().unwrap());
        for i in 0..150 {
            broker
                .enqueue("ai_tasks", &format!("job{i}"), serde_json::json!({}), None, None)
                .unwrap();
        }
        let state = HealthState {
            broker: broker as Arc<dyn Broker>,
            performance: test_performance(),
            config_checksum: "deadbeef".to_string(),
        };
        let response = health_handler(state).await;
        assert!(matches!(response.0.status, HealthStatus::Degraded));
    }

    #[tokio::test]
    async fn response_carries_the_config_checksum_and_a_performance_report() {
        let broker: Arc<dyn Broker> = Arc::new(scheduler_core::broker::SqliteBroker::open_in_memory().unwrap());
        let performance = test_performance();
        performance.record_sample(scheduler_worker::performance::ResourceSample {
            timestamp_secs: 0,
            cpu_percent: 0.5,
            memory_percent: 0.5,
            load_average: 1.0,
        });
        let state = HealthState {
            broker,
            performance,
            config_checksum: "deadbeef".to_string(),
        };
        let response = health_handler(state).await;
        assert_eq!(response.0.config_checksum, "deadbeef");
        assert!(matches!(response.0.performance.cpu_trend, TrendLabel::Stable));
    }
}
