//! AI Task Scheduling Orchestrator
//!
//! The Orchestrator wires together the durable store, the broker, the Beat timer, and
//! one or more Workers, reads environment-driven configuration, and manages the
//! process's graceful-shutdown lifecycle.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod health;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use scheduler_core::broker::{Broker, SqliteBroker};
use scheduler_core::config::Config;
use scheduler_core::store::{SqliteTaskStore, TaskStore};
use scheduler_worker::alerting::{AlertManager, AlertSink, LogConsoleSink};
use scheduler_worker::beat::{default_entries, Beat};
use scheduler_worker::dependency::DependencyScheduler;
use scheduler_worker::metrics::{FixedSystemProbe, MetricsCollector};
use scheduler_worker::notify::{NotificationChannel, NotificationDispatcher, SmsChannel, UnconfiguredChannel};
use scheduler_worker::performance::PerformanceOptimizer;
use scheduler_worker::runner::{ReminderRunner, TaskRunner};
use scheduler_worker::worker::{Worker, WorkerContext, WorkerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How often the monitor task samples queues and re-evaluates alert rules.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Fallback total memory for `PerformanceOptimizer` sizing until a real memory probe is
/// wired in behind `SystemProbe`.
const TOTAL_MEMORY_GB_FALLBACK: f64 = 16.0;

/// Orchestrator version from Cargo.toml.
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "scheduler-server")]
#[command(about = "Orchestrates the AI task scheduling and execution core", long_about = None)]
struct CliArgs {
    /// Address the health endpoint listens on.
    #[arg(long = "health-addr", value_name = "ADDR", default_value = "127.0.0.1:8080")]
    health_addr: SocketAddr,
}

/// Strips a `sqlite://` scheme prefix, if present, to obtain a filesystem path for the
/// bundled rusqlite driver.
fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://").unwrap_or(url)
}

pub struct Orchestrator {
    config: Config,
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertManager>,
    performance: Arc<PerformanceOptimizer>,
    dependencies: Arc<tokio::sync::Mutex<DependencyScheduler>>,
    shutdown_tx: Option<tokio::sync::broadcast::Sender<()>>,
    worker_task: Option<JoinHandle<()>>,
    beat_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn configure(config: Config) -> Result<Self> {
        let store = Arc::new(
            SqliteTaskStore::open(sqlite_path(&config.database.url))
                .context("failed to open task store")?,
        );
        let broker = Arc::new(
            SqliteBroker::open(sqlite_path(&config.broker_url)).context("failed to open broker")?,
        );
        let probe = Box::new(FixedSystemProbe::default());
        let metrics = Arc::new(MetricsCollector::new(probe));

        let mut sinks: HashMap<_, Box<dyn AlertSink>> = HashMap::new();
        sinks.insert(scheduler_core::model::AlertChannel::Log, Box::new(LogConsoleSink));
        sinks.insert(scheduler_core::model::AlertChannel::Console, Box::new(LogConsoleSink));
        let alerts = Arc::new(AlertManager::new(sinks));
        let cpu_cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as u32;
        let performance = Arc::new(PerformanceOptimizer::new(cpu_cores, TOTAL_MEMORY_GB_FALLBACK));

        let dependencies = Arc::new(tokio::sync::Mutex::new(DependencyScheduler::default()));

        Ok(Orchestrator {
            config,
            store,
            broker,
            metrics,
            alerts,
            performance,
            dependencies,
            shutdown_tx: None,
            worker_task: None,
            beat_task: None,
            health_task: None,
            monitor_task: None,
        })
    }

    fn build_dispatcher(&self) -> NotificationDispatcher {
        let mut channels: HashMap<String, Box<dyn NotificationChannel>> = HashMap::new();
        let http_client = reqwest::Client::new();
        channels.insert(
            "sms".to_string(),
            Box::new(SmsChannel::new(http_client, self.config.twilio.clone())),
        );
        channels.insert(
            "email".to_string(),
            Box::new(UnconfiguredChannel { channel_name: "email" }),
        );
        channels.insert(
            "in_app".to_string(),
            Box::new(UnconfiguredChannel { channel_name: "in_app" }),
        );
        NotificationDispatcher::new(channels)
    }

    pub async fn start(&mut self, health_addr: SocketAddr) -> Result<()> {
        info!(version = VERSION, "starting AI task scheduling orchestrator");

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let runner: Arc<dyn TaskRunner> = Arc::new(ReminderRunner);
        let context = Arc::new(WorkerContext {
            broker: self.broker.clone(),
            store: self.store.clone(),
            runner,
            dispatcher: Arc::new(self.build_dispatcher()),
            metrics: self.metrics.clone(),
            dependencies: self.dependencies.clone(),
        });

        let settings = WorkerSettings {
            queues: scheduler_core::defaults::QUEUE_NAMES.iter().map(|s| s.to_string()).collect(),
            concurrency: self.config.worker.concurrency,
            max_tasks_per_child: self.config.worker.max_tasks_per_child,
            task_timeout: self.config.worker.task_timeout,
            soft_cancel_grace: self.config.worker.soft_cancel_grace,
            max_retries: self.config.worker.retry_max_attempts,
        };
        let worker = Worker::new(settings, context);
        let worker_shutdown = shutdown_tx.subscribe();
        self.worker_task = Some(tokio::spawn(async move {
            worker.run("worker-0", worker_shutdown).await;
        }));

        let beat = Beat::new(default_entries(), self.broker.clone());
        let beat_shutdown = shutdown_tx.subscribe();
        self.beat_task = Some(tokio::spawn(async move {
            beat.run(beat_shutdown).await;
        }));

        let health_state = health::HealthState {
            broker: self.broker.clone(),
            performance: self.performance.clone(),
            config_checksum: self.config.checksum(),
        };
        let app = health::router(health_state);
        let listener = tokio::net::TcpListener::bind(health_addr)
            .await
            .with_context(|| format!("failed to bind health listener on {health_addr}"))?;
        let mut health_shutdown = shutdown_tx.subscribe();
        self.health_task = Some(tokio::spawn(async move {
            let shutdown_signal = async move {
                let _ = health_shutdown.recv().await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await {
                error!("health server error: {e}");
            }
        }));

        info!(addr = %health_addr, "health endpoint listening");

        let broker = self.broker.clone();
        let metrics = self.metrics.clone();
        let alerts = self.alerts.clone();
        let performance = self.performance.clone();
        let worker_concurrency = self.config.worker.concurrency as u32;
        let mut monitor_shutdown = shutdown_tx.subscribe();
        self.monitor_task = Some(tokio::spawn(async move {
            run_monitor_loop(broker, metrics, alerts, performance, worker_concurrency, &mut monitor_shutdown).await;
        }));

        Ok(())
    }

    pub async fn shutdown(&mut self) {
        info!("shutting down orchestrator");
        let timeout = self.config.worker.graceful_shutdown_timeout;

        if let Some(tx) = &self.shutdown_tx {
            if let Err(e) = tx.send(()) {
                warn!("failed to broadcast shutdown signal: {e}");
            }
        }

        for (name, handle) in [
            ("worker", self.worker_task.take()),
            ("beat", self.beat_task.take()),
            ("health", self.health_task.take()),
            ("monitor", self.monitor_task.take()),
        ] {
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("{name} task completed"),
                Ok(Err(e)) => warn!("{name} task panicked: {e}"),
                Err(_) => warn!("{name} task did not finish within the shutdown timeout"),
            }
        }
        info!("orchestrator shutdown complete");
    }
}

/// Periodically samples queue depths into `MetricsCollector`, re-evaluates
/// `AlertManager`'s rules against the latest snapshot, and records a
/// `PerformanceOptimizer` resource sample. Grounded on the teacher's reconfigure-check
/// background task: a ticking interval raced against the shutdown broadcast.
async fn run_monitor_loop(
    broker: Arc<dyn Broker>,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertManager>,
    performance: Arc<PerformanceOptimizer>,
    worker_concurrency: u32,
    shutdown: &mut tokio::sync::broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }

        match broker.reclaim_expired_leases() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "reclaimed expired job leases"),
            Err(e) => warn!(error = %e.to_string(), "failed to reclaim expired leases"),
        }
        alerts.cleanup_old_alerts(
            chrono::Duration::hours(scheduler_core::defaults::DEFAULT_ALERT_HISTORY_MAX_AGE_HOURS),
            Utc::now(),
        );

        let mut queue_lengths = HashMap::new();
        for queue in scheduler_core::defaults::QUEUE_NAMES {
            match broker.queue_len(queue) {
                Ok(len) => {
                    queue_lengths.insert(queue.to_string(), len);
                }
                Err(e) => warn!(queue = %queue, error = %e.to_string(), "failed to sample queue length"),
            }
        }
        metrics.record_system_snapshot(worker_concurrency, queue_lengths.clone());

        let failure_rate = metrics.recent_failure_rate(scheduler_worker::worker::EXECUTE_AI_TASK_JOB, 100);
        let system = metrics.current_system_status();
        let snapshot = scheduler_worker::alerting::MetricsSnapshot {
            task_failure_rate: Some(failure_rate),
            memory_percent: system.as_ref().map(|s| s.memory_percent / 100.0),
            cpu_percent: system.as_ref().map(|s| s.cpu_percent / 100.0),
            queue_lengths,
        };
        alerts.check_alerts(&snapshot, Utc::now());

        performance.record_sample(scheduler_worker::performance::ResourceSample {
            timestamp_secs: Utc::now().timestamp(),
            cpu_percent: system.as_ref().map(|s| s.cpu_percent / 100.0).unwrap_or(0.0),
            memory_percent: system.as_ref().map(|s| s.memory_percent / 100.0).unwrap_or(0.0),
            load_average: 0.0,
        });
    }
}

async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());
        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            _ => {
                error!("failed to register signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "scheduler.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scheduler_server=info,scheduler_worker=info,scheduler_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let mut orchestrator = match Orchestrator::configure(config) {
        Ok(o) => o,
        Err(e) => {
            error!("failed to configure orchestrator: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = orchestrator.start(cli_args.health_addr).await {
        error!("failed to start orchestrator: {e}");
        std::process::exit(1);
    }

    setup_shutdown_signal().await;
    orchestrator.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_path_strips_the_scheme_prefix() {
        assert_eq!(sqlite_path("sqlite:///tmp/foo.db"), "/tmp/foo.db");
        assert_eq!(sqlite_path("/tmp/foo.db"), "/tmp/foo.db");
    }
}
