//! Durable persistence of `AITask` records, backed by SQLite.
//!
//! Grounded on `agent/src/database.rs`: a lazily-opened connection behind a mutex, WAL
//! mode plus a busy timeout so concurrent readers don't immediately fail, and retrying
//! transient errors with the same exponential backoff idiom used across the teacher's
//! storage layer. The bundled SQLite build has no `SELECT ... FOR UPDATE SKIP LOCKED`, so
//! atomic claiming is done with a single `UPDATE ... RETURNING` statement inside a
//! transaction, relying on SQLite's serialized single-writer model.

use crate::error::SchedulerError;
use crate::model::{AITask, NewTask, RunOutcome, ScheduleType, TaskFilter, TaskKind, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration as StdDuration;

/// Persistence contract for `AITask` records.
pub trait TaskStore: Send + Sync {
    fn create(&self, spec: NewTask) -> Result<AITask, SchedulerError>;
    fn get(&self, id: i64) -> Result<Option<AITask>, SchedulerError>;
    fn claim_due_tasks(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<AITask>, SchedulerError>;
    fn update_after_run(&self, id: i64, outcome: RunOutcome) -> Result<(), SchedulerError>;
    fn list_for_user(&self, user_id: i64, filter: TaskFilter) -> Result<Vec<AITask>, SchedulerError>;
    fn delete(&self, id: i64, user_id: i64) -> Result<(), SchedulerError>;
}

const MAX_RETRIES: u32 = 5;
const BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 10_000;

/// Runs `op`, retrying on `rusqlite::Error` with exponential backoff (100ms -> 10s,
/// capped at 5 attempts) before surfacing `StoreUnavailable`.
fn with_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T, SchedulerError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(SchedulerError::AlreadyExists(e.to_string()));
            }
            Err(err) => {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(SchedulerError::StoreUnavailable(err.to_string()));
                }
                let backoff_ms = (BASE_BACKOFF_MS * 2u64.pow(attempt - 1)).min(MAX_BACKOFF_MS);
                thread::sleep(StdDuration::from_millis(backoff_ms));
            }
        }
    }
}

pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let conn = Connection::open(path)
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        conn.busy_timeout(StdDuration::from_secs(5))
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        let store = SqliteTaskStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        let store = SqliteTaskStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), SchedulerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ai_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                task_type TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_config TEXT NOT NULL,
                next_run_at TEXT,
                last_run_at TEXT,
                status TEXT NOT NULL,
                ai_context TEXT,
                notification_channels TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_ai_tasks_due
                ON ai_tasks (status, next_run_at);",
        )
        .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<AITask> {
        let task_type: String = row.get("task_type")?;
        let schedule_type: String = row.get("schedule_type")?;
        let schedule_config_raw: String = row.get("schedule_config")?;
        let status: String = row.get("status")?;
        let channels_raw: String = row.get("notification_channels")?;

        let schedule_type_enum = parse_schedule_type(&schedule_type);
        let schedule_config_value: serde_json::Value =
            serde_json::from_str(&schedule_config_raw).unwrap_or(serde_json::Value::Null);
        let schedule_config =
            crate::model::parse_schedule_config(schedule_type_enum, schedule_config_value)
                .unwrap_or(crate::model::ScheduleConfig::Custom {
                    interval_minutes: 60,
                });

        Ok(AITask {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            task_type: parse_task_kind(&task_type),
            schedule_type: schedule_type_enum,
            schedule_config,
            next_run_at: row.get::<_, Option<String>>("next_run_at")?.and_then(|s| parse_instant(&s)),
            last_run_at: row.get::<_, Option<String>>("last_run_at")?.and_then(|s| parse_instant(&s)),
            status: parse_status(&status),
            ai_context: row.get("ai_context")?,
            notification_channels: channels_raw
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            created_at: parse_instant(&row.get::<_, String>("created_at")?).unwrap_or_default(),
            updated_at: parse_instant(&row.get::<_, String>("updated_at")?).unwrap_or_default(),
        })
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

fn parse_task_kind(raw: &str) -> TaskKind {
    match raw {
        "reminder" => TaskKind::Reminder,
        "periodic_task" => TaskKind::PeriodicTask,
        _ => TaskKind::AutomatedTask,
    }
}

fn task_kind_str(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Reminder => "reminder",
        TaskKind::AutomatedTask => "automated_task",
        TaskKind::PeriodicTask => "periodic_task",
    }
}

fn parse_schedule_type(raw: &str) -> ScheduleType {
    match raw {
        "daily" => ScheduleType::Daily,
        "weekly" => ScheduleType::Weekly,
        "monthly" => ScheduleType::Monthly,
        "custom" => ScheduleType::Custom,
        _ => ScheduleType::Once,
    }
}

fn schedule_type_str(t: ScheduleType) -> &'static str {
    match t {
        ScheduleType::Once => "once",
        ScheduleType::Daily => "daily",
        ScheduleType::Weekly => "weekly",
        ScheduleType::Monthly => "monthly",
        ScheduleType::Custom => "custom",
    }
}

fn parse_status(raw: &str) -> TaskStatus {
    match raw {
        "processing" => TaskStatus::Processing,
        "paused" => TaskStatus::Paused,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        _ => TaskStatus::Active,
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Active => "active",
        TaskStatus::Processing => "processing",
        TaskStatus::Paused => "paused",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, spec: NewTask) -> Result<AITask, SchedulerError> {
        crate::utils::require_non_blank("title", &spec.title)?;
        let now = Utc::now();
        let schedule_config_json = serde_json::to_string(&spec.schedule_config)
            .map_err(|e| SchedulerError::InvalidSpec(e.to_string()))?;
        let channels = spec.notification_channels.join(",");

        let id = with_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO ai_tasks (
                    user_id, title, description, task_type, schedule_type, schedule_config,
                    next_run_at, last_run_at, status, ai_context, notification_channels,
                    created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,NULL,?8,?9,?10,?11,?11)",
                params![
                    spec.user_id,
                    spec.title,
                    spec.description,
                    task_kind_str(spec.task_type),
                    schedule_type_str(spec.schedule_config.schedule_type()),
                    schedule_config_json,
                    spec.next_run_at.map(|t| t.to_rfc3339()),
                    status_str(TaskStatus::Active),
                    spec.ai_context,
                    channels,
                    now.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        self.get(id)?
            .ok_or_else(|| SchedulerError::NotFound(format!("task {id} vanished after insert")))
    }

    fn get(&self, id: i64) -> Result<Option<AITask>, SchedulerError> {
        with_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT * FROM ai_tasks WHERE id = ?1",
                params![id],
                Self::row_to_task,
            )
            .optional()
        })
    }

    fn claim_due_tasks(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<AITask>, SchedulerError> {
        with_retry(|| {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM ai_tasks
                     WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
                     ORDER BY next_run_at ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![now.to_rfc3339(), limit], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()?
            };

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                let updated = tx.execute(
                    "UPDATE ai_tasks SET status = 'processing', updated_at = ?2
                     WHERE id = ?1 AND status = 'active'",
                    params![id, now.to_rfc3339()],
                )?;
                if updated == 1 {
                    let task = tx.query_row(
                        "SELECT * FROM ai_tasks WHERE id = ?1",
                        params![id],
                        Self::row_to_task,
                    )?;
                    claimed.push(task);
                }
            }
            tx.commit()?;
            Ok(claimed)
        })
    }

    fn update_after_run(&self, id: i64, outcome: RunOutcome) -> Result<(), SchedulerError> {
        let current = self
            .get(id)?
            .ok_or_else(|| SchedulerError::NotFound(format!("task {id}")))?;
        if !current.status.can_transition_to(outcome.status) {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "{:?} -> {:?}",
                current.status, outcome.status
            )));
        }

        with_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE ai_tasks SET status = ?2, last_run_at = ?3, next_run_at = ?4,
                 last_error = ?5, updated_at = ?6 WHERE id = ?1",
                params![
                    id,
                    status_str(outcome.status),
                    outcome.last_run_at.to_rfc3339(),
                    outcome.next_run_at.map(|t| t.to_rfc3339()),
                    outcome.error,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    fn list_for_user(&self, user_id: i64, filter: TaskFilter) -> Result<Vec<AITask>, SchedulerError> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        with_retry(|| {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT * FROM ai_tasks WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit], Self::row_to_task)?;
            let mut tasks = rows.collect::<rusqlite::Result<Vec<AITask>>>()?;
            if let Some(status) = filter.status {
                tasks.retain(|t| t.status == status);
            }
            if let Some(task_type) = filter.task_type {
                tasks.retain(|t| t.task_type == task_type);
            }
            Ok(tasks)
        })
    }

    fn delete(&self, id: i64, user_id: i64) -> Result<(), SchedulerError> {
        let affected = with_retry(|| {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM ai_tasks WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
        })?;
        if affected == 0 {
            return Err(SchedulerError::NotFound(format!("task {id} for user {user_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScheduleConfig;

    fn sample_spec() -> NewTask {
        NewTask {
            user_id: 1,
            title: "Water plants".into(),
            description: None,
            task_type: TaskKind::Reminder,
            schedule_config: ScheduleConfig::Daily { hour: 9, minute: 0 },
            next_run_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            ai_context: None,
            notification_channels: vec!["sms".into()],
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let created = store.create(sample_spec()).unwrap();
        let fetched = store.get(created.id).unwrap().unwrap();
        assert_eq!(fetched.title, "Water plants");
        assert_eq!(fetched.status, TaskStatus::Active);
    }

    #[test]
    fn claim_due_tasks_transitions_to_processing_exactly_once() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let created = store.create(sample_spec()).unwrap();
        let first = store.claim_due_tasks(10, Utc::now()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, created.id);
        assert_eq!(first[0].status, TaskStatus::Processing);

        let second = store.claim_due_tasks(10, Utc::now()).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn update_after_run_rejects_invalid_transition() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let created = store.create(sample_spec()).unwrap();
        let err = store
            .update_after_run(
                created.id,
                RunOutcome {
                    status: TaskStatus::Completed,
                    last_run_at: Utc::now(),
                    next_run_at: None,
                    error: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidStateTransition(_)));
    }

    #[test]
    fn delete_requires_matching_user() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let created = store.create(sample_spec()).unwrap();
        assert!(store.delete(created.id, 999).is_err());
        assert!(store.delete(created.id, 1).is_ok());
    }
}
