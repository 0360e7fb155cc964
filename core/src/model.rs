//! Domain types shared by every component of the scheduling core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Kind of work an [`AITask`] represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Reminder,
    AutomatedTask,
    PeriodicTask,
}

/// Schedule family, and the discriminant that selects a [`ScheduleConfig`] variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

/// Lifecycle state of an [`AITask`]. See `SchedulerError::InvalidStateTransition` for
/// the guard that keeps transitions inside the state machine described in SPEC_FULL §4.1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    /// True if `self -> next` is an allowed edge in the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Active, Processing)
                | (Active, Paused)
                | (Paused, Active)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Active)
        )
    }
}

/// Schedule-type-specific configuration. The wire format is documented in SPEC_FULL §6;
/// each variant corresponds to one `schedule_type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScheduleConfig {
    Once {
        run_at: DateTime<Utc>,
    },
    Daily {
        #[serde(default)]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },
    Weekly {
        weekdays: Vec<u32>,
        #[serde(default)]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },
    Monthly {
        day: u32,
        #[serde(default)]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },
    Custom {
        interval_minutes: i64,
    },
}

impl ScheduleConfig {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleConfig::Once { .. } => ScheduleType::Once,
            ScheduleConfig::Daily { .. } => ScheduleType::Daily,
            ScheduleConfig::Weekly { .. } => ScheduleType::Weekly,
            ScheduleConfig::Monthly { .. } => ScheduleType::Monthly,
            ScheduleConfig::Custom { .. } => ScheduleType::Custom,
        }
    }
}

/// The unit of work. See SPEC_FULL §3 for the full field-by-field contract.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AITask {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub task_type: TaskKind,
    pub schedule_type: ScheduleType,
    pub schedule_config: ScheduleConfig,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub ai_context: Option<String>,
    pub notification_channels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AITask {
    /// A task is due when it is `active` and its `next_run_at` has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Active
            && self.next_run_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Grounded on `AITask.should_notify` in the original model: an SMS channel is
    /// requested whenever `"sms"` is among the configured channels.
    pub fn wants_channel(&self, channel: &str) -> bool {
        self.notification_channels.iter().any(|c| c == channel)
    }
}

/// A new task submission, before a store assigns it an id.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub task_type: TaskKind,
    pub schedule_config: ScheduleConfig,
    pub next_run_at: Option<DateTime<Utc>>,
    pub ai_context: Option<String>,
    pub notification_channels: Vec<String>,
}

/// Patch applied by `TaskStore::update_after_run`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: TaskStatus,
    pub last_run_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Filter accepted by `TaskStore::list_for_user`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskKind>,
    pub limit: u32,
}

/// `JSON` deserialisation for `AITask` dispatches `schedule_config`'s shape from the
/// sibling `schedule_type` field, the same "read the tag first, then build the typed
/// payload" idiom the teacher uses for `TaskConfig` (see `TaskConfigVisitor`), generalised
/// from TOML to JSON since this is the wire format named in SPEC_FULL §6.
impl<'de> Deserialize<'de> for AITask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{Error, MapAccess, Visitor};
        use std::fmt;

        struct AITaskVisitor;

        impl<'de> Visitor<'de> for AITaskVisitor {
            type Value = AITask;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an AITask record")
            }

            fn visit_map<V>(self, mut map: V) -> Result<AITask, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut id = None;
                let mut user_id = None;
                let mut title = None;
                let mut description = None;
                let mut task_type = None;
                let mut schedule_type: Option<ScheduleType> = None;
                let mut schedule_config_raw: Option<serde_json::Value> = None;
                let mut next_run_at = None;
                let mut last_run_at = None;
                let mut status = None;
                let mut ai_context = None;
                let mut notification_channels = None;
                let mut created_at = None;
                let mut updated_at = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "id" => id = Some(map.next_value()?),
                        "user_id" => user_id = Some(map.next_value()?),
                        "title" => title = Some(map.next_value()?),
                        "description" => description = Some(map.next_value()?),
                        "task_type" => task_type = Some(map.next_value()?),
                        "schedule_type" => schedule_type = Some(map.next_value()?),
                        "schedule_config" => {
                            schedule_config_raw = Some(map.next_value()?)
                        }
                        "next_run_at" => next_run_at = Some(map.next_value()?),
                        "last_run_at" => last_run_at = Some(map.next_value()?),
                        "status" => status = Some(map.next_value()?),
                        "ai_context" => ai_context = Some(map.next_value()?),
                        "notification_channels" => {
                            notification_channels = Some(map.next_value()?)
                        }
                        "created_at" => created_at = Some(map.next_value()?),
                        "updated_at" => updated_at = Some(map.next_value()?),
                        _ => {
                            let _: serde::de::IgnoredAny = map.next_value()?;
                        }
                    }
                }

                let schedule_type =
                    schedule_type.ok_or_else(|| Error::missing_field("schedule_type"))?;
                let raw = schedule_config_raw
                    .ok_or_else(|| Error::missing_field("schedule_config"))?;
                let schedule_config = parse_schedule_config(schedule_type, raw)
                    .map_err(Error::custom)?;

                Ok(AITask {
                    id: id.ok_or_else(|| Error::missing_field("id"))?,
                    user_id: user_id.ok_or_else(|| Error::missing_field("user_id"))?,
                    title: title.ok_or_else(|| Error::missing_field("title"))?,
                    description: description.unwrap_or(None),
                    task_type: task_type.ok_or_else(|| Error::missing_field("task_type"))?,
                    schedule_type,
                    schedule_config,
                    next_run_at: next_run_at.unwrap_or(None),
                    last_run_at: last_run_at.unwrap_or(None),
                    status: status.ok_or_else(|| Error::missing_field("status"))?,
                    ai_context: ai_context.unwrap_or(None),
                    notification_channels: notification_channels.unwrap_or_default(),
                    created_at: created_at.ok_or_else(|| Error::missing_field("created_at"))?,
                    updated_at: updated_at.ok_or_else(|| Error::missing_field("updated_at"))?,
                })
            }
        }

        deserializer.deserialize_map(AITaskVisitor)
    }
}

/// Build a [`ScheduleConfig`] of the variant named by `schedule_type` from a raw JSON
/// object, rather than letting an untagged enum guess the shape.
pub fn parse_schedule_config(
    schedule_type: ScheduleType,
    raw: serde_json::Value,
) -> Result<ScheduleConfig, String> {
    match schedule_type {
        ScheduleType::Once => serde_json::from_value(raw)
            .map(|run_at: DateTime<Utc>| ScheduleConfig::Once { run_at })
            .or_else(|_| {
                let run_at = raw
                    .get("run_at")
                    .ok_or("once schedule requires run_at")?;
                serde_json::from_value(run_at.clone())
                    .map(|run_at| ScheduleConfig::Once { run_at })
                    .map_err(|e| e.to_string())
            }),
        ScheduleType::Daily => {
            let hour = field_u32(&raw, "hour").unwrap_or(9);
            let minute = field_u32(&raw, "minute").unwrap_or(0);
            Ok(ScheduleConfig::Daily { hour, minute })
        }
        ScheduleType::Weekly => {
            let weekdays = match raw.get("weekdays") {
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .map(|v| v.as_u64().map(|n| n as u32).ok_or("weekday must be an integer"))
                    .collect::<Result<Vec<_>, _>>()?,
                Some(_) => return Err("weekdays must be a list".to_string()),
                None => vec![0],
            };
            let hour = field_u32(&raw, "hour").unwrap_or(9);
            let minute = field_u32(&raw, "minute").unwrap_or(0);
            Ok(ScheduleConfig::Weekly {
                weekdays,
                hour,
                minute,
            })
        }
        ScheduleType::Monthly => {
            let day = field_u32(&raw, "day").ok_or("monthly schedule requires day")?;
            let hour = field_u32(&raw, "hour").unwrap_or(9);
            let minute = field_u32(&raw, "minute").unwrap_or(0);
            Ok(ScheduleConfig::Monthly { day, hour, minute })
        }
        ScheduleType::Custom => {
            let interval_minutes = raw
                .get("interval_minutes")
                .and_then(|v| v.as_i64())
                .ok_or("custom schedule requires interval_minutes")?;
            Ok(ScheduleConfig::Custom { interval_minutes })
        }
    }
}

fn field_u32(raw: &serde_json::Value, key: &str) -> Option<u32> {
    raw.get(key).and_then(|v| v.as_u64()).map(|n| n as u32)
}

/// Severity of an [`Alert`] / [`AlertRule`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Delivery channel for an [`Alert`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    Log,
    Console,
    Email,
    Slack,
    Webhook,
}

/// Monitoring rule evaluated by the `AlertManager`. Grounded on
/// `workers/utils/alerting.py::AlertRule`.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub window: chrono::Duration,
    pub channels: Vec<AlertChannel>,
    pub severity: AlertSeverity,
    pub message_template: String,
    pub enabled: bool,
    pub cooldown: chrono::Duration,
    pub last_triggered: Option<DateTime<Utc>>,
}

/// Closed set of alert conditions. `SystemIssue` is a catch-all reserved for rules with
/// a custom evaluator supplied out of band; it never fires from the default rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCondition {
    TaskFailureRate,
    MemoryUsage,
    CpuUsage,
    QueueLength,
    SystemIssue,
}

/// An instantiated alert event.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// How a dependent task relates to its dependency. See SPEC_FULL §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyType {
    Requires,
    RequiresAny,
    Optional,
    Conditional,
}

/// An edge (or set of edges) in the dependency DAG.
#[derive(Debug, Clone)]
pub struct TaskDependency {
    pub task_id: String,
    pub depends_on: Vec<String>,
    pub dependency_type: DependencyType,
    pub condition: Option<String>,
    pub retry_on_failure: bool,
    pub max_retries: u32,
}

/// Execution status tracked by the `DependencyScheduler`, distinct from [`TaskStatus`]:
/// this tracks a single in-flight execution attempt rather than the durable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Per-task execution metrics. Grounded on `workers/utils/metrics.py::TaskMetrics`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub task_id: String,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_secs: Option<f64>,
    pub cpu_percent_start: Option<f64>,
    pub cpu_percent_end: Option<f64>,
    pub cpu_percent_peak: Option<f64>,
    pub memory_percent_start: Option<f64>,
    pub memory_percent_end: Option<f64>,
    pub memory_percent_peak: Option<f64>,
    pub status: String,
    pub error: Option<String>,
    pub retry_count: u32,
    pub queue_time_secs: Option<f64>,
    pub worker_id: Option<String>,
    pub queue_name: Option<String>,
    pub priority: Option<i32>,
}

/// Point-in-time system resource sample. Grounded on
/// `workers/utils/metrics.py::SystemMetrics`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_gb: f64,
    pub disk_usage_percent: f64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
    pub active_connections: u64,
    pub worker_count: u32,
    pub queue_lengths: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_the_state_machine() {
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Active));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Active));
        assert!(!TaskStatus::Active.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn parses_schedule_config_by_sibling_tag() {
        let raw = serde_json::json!({ "hour": 9, "minute": 30 });
        let cfg = parse_schedule_config(ScheduleType::Daily, raw).unwrap();
        assert_eq!(cfg, ScheduleConfig::Daily { hour: 9, minute: 30 });
    }

    #[test]
    fn weekly_missing_key_defaults_to_monday() {
        let raw = serde_json::json!({});
        let cfg = parse_schedule_config(ScheduleType::Weekly, raw).unwrap();
        match cfg {
            ScheduleConfig::Weekly { weekdays, .. } => assert_eq!(weekdays, vec![0]),
            _ => panic!("expected weekly"),
        }
    }

    #[test]
    fn deserializes_full_ai_task_from_json() {
        let json = serde_json::json!({
            "id": 1,
            "user_id": 42,
            "title": "Take meds",
            "description": null,
            "task_type": "reminder",
            "schedule_type": "once",
            "schedule_config": { "run_at": "2025-01-01T09:00:00Z" },
            "next_run_at": "2025-01-01T09:00:00Z",
            "last_run_at": null,
            "status": "active",
            "ai_context": null,
            "notification_channels": ["sms"],
            "created_at": "2024-12-31T00:00:00Z",
            "updated_at": "2024-12-31T00:00:00Z"
        });
        let task: AITask = serde_json::from_value(json).unwrap();
        assert_eq!(task.title, "Take meds");
        assert!(matches!(task.schedule_config, ScheduleConfig::Once { .. }));
        assert!(task.wants_channel("sms"));
    }
}
