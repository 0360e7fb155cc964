//! A single Worker: one or more concurrent slots pulling jobs from assigned queues,
//! enforcing per-execution timeouts, and driving the retry/backoff path.
//!
//! Grounded on `agent/src/scheduler.rs` and `agent/src/tasks.rs`: the
//! `tokio::select! { ...; _ = sleep(timeout) => ... }` timeout-and-cancel idiom per
//! execution, and a `tokio::sync::broadcast` shutdown signal that every slot's dequeue
//! loop selects against so it stops pulling new work promptly. Generalised from a
//! fixed-ticker-per-config-entry model to a Broker-queue-pull model.

use crate::dependency::{DependencyScheduler, ExecutionStatus};
use crate::metrics::MetricsCollector;
use crate::notify::NotificationDispatcher;
use crate::runner::TaskRunner;
use scheduler_core::broker::{default_priority, Broker, Job};
use scheduler_core::defaults::DEFAULT_CLAIM_BATCH_LIMIT;
use scheduler_core::model::{RunOutcome, TaskStatus};
use scheduler_core::schedule::next_run;
use scheduler_core::store::TaskStore;
use scheduler_core::utils::default_retry_backoff;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Static configuration for one Worker process.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub max_tasks_per_child: u32,
    pub task_timeout: Duration,
    pub soft_cancel_grace: Duration,
    pub max_retries: u32,
}

/// Dependencies a Worker slot needs to process one job end to end.
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn TaskStore>,
    pub runner: Arc<dyn TaskRunner>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub metrics: Arc<MetricsCollector>,
    pub dependencies: Arc<tokio::sync::Mutex<DependencyScheduler>>,
}

pub struct Worker {
    settings: WorkerSettings,
    context: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(settings: WorkerSettings, context: Arc<WorkerContext>) -> Self {
        Worker { settings, context }
    }

    /// Spawns `settings.concurrency` slots, each looping until `shutdown` fires.
    pub async fn run(&self, worker_id: &str, mut shutdown: broadcast::Receiver<()>) {
        let mut handles = Vec::new();
        for slot_index in 0..self.settings.concurrency {
            let settings = self.settings.clone();
            let context = self.context.clone();
            let slot_id = format!("{worker_id}-slot{slot_index}");
            let mut slot_shutdown = shutdown.resubscribe();
            handles.push(tokio::spawn(async move {
                run_slot(slot_id, settings, context, &mut slot_shutdown).await;
            }));
        }
        let _ = shutdown.recv().await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_slot(
    slot_id: String,
    settings: WorkerSettings,
    context: Arc<WorkerContext>,
    shutdown: &mut broadcast::Receiver<()>,
) {
    let mut completions = 0u32;
    loop {
        if completions >= settings.max_tasks_per_child {
            tracing::info!(slot = %slot_id, "reached max_tasks_per_child, exiting for respawn");
            return;
        }

        let job = 'dequeue: loop {
            for queue in &settings.queues {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => return,
                    result = dequeue_one(&context.broker, queue, &slot_id, settings.task_timeout) => {
                        if let Some(job) = result {
                            break 'dequeue job;
                        }
                    }
                }
            }
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        };

        process_job(&job, &settings, &context, &slot_id).await;
        completions += 1;
    }
}

async fn dequeue_one(
    broker: &Arc<dyn Broker>,
    queue: &str,
    worker_id: &str,
    task_timeout: Duration,
) -> Option<Job> {
    let visibility = task_timeout + Duration::from_secs(30);
    broker.dequeue(queue, worker_id, visibility).ok().flatten()
}

/// Beat's cron entry that seeds due-task discovery; recognised by name so the Worker
/// can claim and fan it out instead of treating it like an ordinary job.
const PROCESS_DUE_AI_TASKS_JOB: &str = "process_due_ai_tasks";
/// Per-task job enqueued by `handle_seed_job`, one per task `claim_due_tasks` claims.
pub const EXECUTE_AI_TASK_JOB: &str = "execute_ai_task";

async fn process_job(job: &Job, settings: &WorkerSettings, context: &Arc<WorkerContext>, worker_id: &str) {
    if job.task_name == PROCESS_DUE_AI_TASKS_JOB {
        handle_seed_job(job, context).await;
        return;
    }

    let task_id = job
        .payload
        .get("task_id")
        .and_then(|v| v.as_i64());

    context.metrics.start(
        &job.id.to_string(),
        &job.task_name,
        Some(job.queue.as_str()),
        Some(job.priority),
        Some(worker_id),
    );
    {
        let mut deps = context.dependencies.lock().await;
        deps.start_task_execution(&job.id.to_string());
    }

    let outcome = tokio::select! {
        result = execute_job(task_id, context) => result,
        _ = tokio::time::sleep(settings.task_timeout) => {
            tokio::time::sleep(settings.soft_cancel_grace).await;
            JobOutcome::TimedOut
        }
    };

    let (execution_status, error) = match outcome {
        JobOutcome::Completed { task_id } => {
            finish_success(context, job, task_id, worker_id).await;
            context.metrics.end(&job.id.to_string(), "completed", None);
            (ExecutionStatus::Completed, None)
        }
        JobOutcome::Failed { reason } => {
            handle_failure(context, job, settings, &reason).await;
            context.metrics.end(&job.id.to_string(), "failed", Some(reason.clone()));
            (ExecutionStatus::Failed, Some(reason))
        }
        JobOutcome::TimedOut => {
            handle_failure(context, job, settings, "task execution timed out").await;
            context.metrics.end(&job.id.to_string(), "failed", Some("timed out".into()));
            (ExecutionStatus::Failed, Some("timed out".to_string()))
        }
        JobOutcome::NotApplicable => {
            let _ = context.broker.ack(job.id);
            (ExecutionStatus::Skipped, None)
        }
    };

    let mut deps = context.dependencies.lock().await;
    deps.complete_task_execution(&job.id.to_string(), execution_status, error);
}

/// Claims every due task via `TaskStore::claim_due_tasks` and re-enqueues one
/// `execute_ai_task` job per claimed task, carrying its `task_id`. This is the only
/// path that turns Beat's minute-resolution `process_due_ai_tasks` tick into work an
/// ordinary slot can execute through `execute_job`.
async fn handle_seed_job(job: &Job, context: &Arc<WorkerContext>) {
    match context.store.claim_due_tasks(DEFAULT_CLAIM_BATCH_LIMIT, Utc::now()) {
        Ok(tasks) => {
            for task in tasks {
                let payload = serde_json::json!({ "task_id": task.id });
                if let Err(e) = context.broker.enqueue(
                    "ai_tasks",
                    EXECUTE_AI_TASK_JOB,
                    payload,
                    Some(default_priority("ai_tasks")),
                    None,
                ) {
                    tracing::error!(task_id = task.id, error = %e.to_string(), "failed to enqueue claimed task");
                }
            }
        }
        Err(e) => tracing::error!(error = %e.to_string(), "failed to claim due tasks"),
    }
    let _ = context.broker.ack(job.id);
}

enum JobOutcome {
    Completed { task_id: i64 },
    Failed { reason: String },
    TimedOut,
    NotApplicable,
}

async fn execute_job(task_id: Option<i64>, context: &Arc<WorkerContext>) -> JobOutcome {
    let Some(task_id) = task_id else {
        return JobOutcome::NotApplicable;
    };
    let task = match context.store.get(task_id) {
        Ok(Some(task)) => task,
        Ok(None) => return JobOutcome::Failed { reason: format!("task {task_id} not found") },
        Err(e) => return JobOutcome::Failed { reason: e.to_string() },
    };

    {
        let deps = context.dependencies.lock().await;
        if !deps.can_execute(&task_id.to_string()) {
            return JobOutcome::NotApplicable;
        }
    }

    let result = context.runner.execute(&task).await;
    if !result.success {
        return JobOutcome::Failed { reason: result.message };
    }

    if !task.notification_channels.is_empty() {
        let mut ctx = HashMap::new();
        ctx.insert("title".to_string(), task.title.clone());
        let _ = context
            .dispatcher
            .send(&task.notification_channels, &result.message, &ctx)
            .await;
    }

    JobOutcome::Completed { task_id }
}

async fn finish_success(context: &Arc<WorkerContext>, job: &Job, task_id: i64, _worker_id: &str) {
    let now = Utc::now();
    let task = match context.store.get(task_id) {
        Ok(Some(t)) => t,
        _ => {
            let _ = context.broker.ack(job.id);
            return;
        }
    };

    let next = next_run(&task.schedule_config, now).unwrap_or(None);
    let status = if next.is_some() {
        TaskStatus::Active
    } else {
        TaskStatus::Completed
    };

    let _ = context.store.update_after_run(
        task_id,
        RunOutcome {
            status,
            last_run_at: now,
            next_run_at: next,
            error: None,
        },
    );
    let _ = context.broker.ack(job.id);
}

async fn handle_failure(context: &Arc<WorkerContext>, job: &Job, settings: &WorkerSettings, reason: &str) {
    if job.retry_count < settings.max_retries {
        let backoff = default_retry_backoff(job.retry_count);
        let eta = Utc::now() + backoff;
        let _ = context.broker.enqueue(
            &job.queue,
            &job.task_name,
            job.payload.clone(),
            Some(job.priority),
            Some(eta),
        );
        let _ = context.broker.ack(job.id);
        return;
    }

    if let Some(task_id) = job.payload.get("task_id").and_then(|v| v.as_i64()) {
        let _ = context.store.update_after_run(
            task_id,
            RunOutcome {
                status: TaskStatus::Failed,
                last_run_at: Utc::now(),
                next_run_at: None,
                error: Some(reason.to_string()),
            },
        );
    }
    let _ = context.broker.ack(job.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencyScheduler;
    use crate::metrics::{FixedSystemProbe, MetricsCollector};
    use crate::notify::NotificationDispatcher;
    use crate::runner::ReminderRunner;
    use scheduler_core::broker::SqliteBroker;
    use scheduler_core::model::{NewTask, ScheduleConfig, TaskKind};
    use scheduler_core::store::SqliteTaskStore;

    #[test]
    fn visibility_timeout_adds_the_grace_window() {
        let timeout = Duration::from_secs(60);
        assert_eq!(timeout + Duration::from_secs(30), Duration::from_secs(90));
    }

    fn test_context() -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            broker: Arc::new(SqliteBroker::open_in_memory().unwrap()),
            store: Arc::new(SqliteTaskStore::open_in_memory().unwrap()),
            runner: Arc::new(ReminderRunner),
            dispatcher: Arc::new(NotificationDispatcher::new(HashMap::new())),
            metrics: Arc::new(MetricsCollector::new(Box::new(FixedSystemProbe::default()))),
            dependencies: Arc::new(tokio::sync::Mutex::new(DependencyScheduler::default())),
        })
    }

    #[tokio::test]
    async fn process_due_ai_tasks_claims_and_fans_out_one_job_per_due_task() {
        let context = test_context();
        let created = context
            .store
            .create(NewTask {
                user_id: 1,
                title: "Water plants".into(),
                description: None,
                task_type: TaskKind::Reminder,
                schedule_config: ScheduleConfig::Daily { hour: 9, minute: 0 },
                next_run_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                ai_context: None,
                notification_channels: vec![],
            })
            .unwrap();

        context
            .broker
            .enqueue("ai_tasks", PROCESS_DUE_AI_TASKS_JOB, serde_json::json!({}), None, None)
            .unwrap();
        let seed_job = context
            .broker
            .dequeue("ai_tasks", "w1", Duration::from_secs(30))
            .unwrap()
            .unwrap();

        let settings = WorkerSettings {
            queues: vec!["ai_tasks".to_string()],
            concurrency: 1,
            max_tasks_per_child: 1,
            task_timeout: Duration::from_secs(5),
            soft_cancel_grace: Duration::from_secs(1),
            max_retries: 0,
        };
        process_job(&seed_job, &settings, &context, "w1").await;

        let fanned_out = context
            .broker
            .dequeue("ai_tasks", "w2", Duration::from_secs(30))
            .unwrap()
            .unwrap();
        assert_eq!(fanned_out.task_name, EXECUTE_AI_TASK_JOB);
        assert_eq!(fanned_out.payload.get("task_id").and_then(|v| v.as_i64()), Some(created.id));
    }
}
