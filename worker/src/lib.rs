//! Execution-side components of the AI task scheduling core: the dependency graph,
//! metrics, alerting, performance tuning, notification dispatch, the Worker's slot
//! loop, and the Beat timer. Everything here is async and tokio-flavoured; domain types
//! and persistence live in `scheduler-core`.

pub mod alerting;
pub mod beat;
pub mod dependency;
pub mod metrics;
pub mod notify;
pub mod performance;
pub mod runner;
pub mod worker;

pub use alerting::{AlertManager, AlertSink};
pub use beat::{Beat, BeatEntry};
pub use dependency::DependencyScheduler;
pub use metrics::{MetricsCollector, SystemProbe};
pub use notify::{NotificationChannel, NotificationDispatcher};
pub use performance::PerformanceOptimizer;
pub use runner::{ExecutionResult, LlmTaskRunner, ReminderRunner, TaskRunner};
pub use worker::{Worker, WorkerContext, WorkerSettings};
