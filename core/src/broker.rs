//! Priority-aware, persistent FIFO queues shared by every Worker.
//!
//! Grounded on `agent/src/database/db_queue.rs`'s status-enum-driven queue table with
//! `next_retry_at` backoff, generalised from a single metrics-send queue to the five
//! named queues in SPEC_FULL §6. Visibility-timeout redelivery replaces the teacher's
//! fixed retry column: a dequeued-but-unacked job becomes visible again once its
//! `invisible_until` passes, the same "lease" idiom used for `claim_due_tasks`.

use crate::defaults::QUEUE_NAMES;
use crate::error::SchedulerError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

/// A unit of work pulled from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub retry_count: u32,
}

pub fn default_priority(queue: &str) -> i32 {
    match queue {
        "ai_tasks" => 10,
        "sync_tasks" => 7,
        "email_tasks" => 5,
        "file_tasks" => 3,
        "maintenance_tasks" => 1,
        _ => 0,
    }
}

/// Priority-aware FIFO queue contract shared by every Worker and the Orchestrator.
pub trait Broker: Send + Sync {
    fn enqueue(
        &self,
        queue: &str,
        task_name: &str,
        payload: serde_json::Value,
        priority: Option<i32>,
        eta: Option<DateTime<Utc>>,
    ) -> Result<i64, SchedulerError>;

    /// Pulls the highest-priority, earliest-eligible job from `queue`, if any, marking
    /// it invisible until `visibility_timeout` elapses.
    fn dequeue(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: StdDuration,
    ) -> Result<Option<Job>, SchedulerError>;

    fn ack(&self, job_id: i64) -> Result<(), SchedulerError>;
    fn nack(&self, job_id: i64, requeue: bool) -> Result<(), SchedulerError>;
    fn queue_len(&self, queue: &str) -> Result<u64, SchedulerError>;

    /// Sweeps leased jobs whose visibility timeout has passed back to `ready`, giving
    /// at-least-once redelivery for workers that crashed or stalled mid-job. Callers
    /// (the Orchestrator's monitor loop) run this periodically.
    fn reclaim_expired_leases(&self) -> Result<usize, SchedulerError>;
}

pub struct SqliteBroker {
    conn: Mutex<Connection>,
}

impl SqliteBroker {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let conn = Connection::open(path)
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        conn.busy_timeout(StdDuration::from_secs(5))
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        let broker = SqliteBroker {
            conn: Mutex::new(conn),
        };
        broker.migrate()?;
        Ok(broker)
    }

    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        let broker = SqliteBroker {
            conn: Mutex::new(conn),
        };
        broker.migrate()?;
        Ok(broker)
    }

    fn migrate(&self) -> Result<(), SchedulerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS broker_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                task_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                eta TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'ready',
                invisible_until TEXT,
                worker_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_broker_jobs_pull
                ON broker_jobs (queue, status, priority DESC, id ASC);",
        )
        .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))
    }

    fn validate_queue(queue: &str) -> Result<(), SchedulerError> {
        if QUEUE_NAMES.contains(&queue) {
            Ok(())
        } else {
            Err(SchedulerError::NoSuchQueue(queue.to_string()))
        }
    }
}

impl Broker for SqliteBroker {
    fn enqueue(
        &self,
        queue: &str,
        task_name: &str,
        payload: serde_json::Value,
        priority: Option<i32>,
        eta: Option<DateTime<Utc>>,
    ) -> Result<i64, SchedulerError> {
        Self::validate_queue(queue)?;
        let priority = priority.unwrap_or_else(|| default_priority(queue));
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| SchedulerError::InvalidSpec(e.to_string()))?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO broker_jobs (queue, task_name, payload, priority, eta, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'ready')",
            params![
                queue,
                task_name,
                payload_json,
                priority,
                eta.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    fn dequeue(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: StdDuration,
    ) -> Result<Option<Job>, SchedulerError> {
        Self::validate_queue(queue)?;
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;

        let candidate: Option<(i64, String, String, i32, u32)> = tx
            .query_row(
                "SELECT id, task_name, payload, priority, retry_count FROM broker_jobs
                 WHERE queue = ?1 AND status = 'ready'
                   AND (eta IS NULL OR eta <= ?2)
                 ORDER BY priority DESC, id ASC LIMIT 1",
                params![queue, now.to_rfc3339()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;

        let Some((id, task_name, payload_raw, priority, retry_count)) = candidate else {
            return Ok(None);
        };

        let invisible_until = now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();
        tx.execute(
            "UPDATE broker_jobs SET status = 'leased', invisible_until = ?2, worker_id = ?3
             WHERE id = ?1",
            params![id, invisible_until.to_rfc3339(), worker_id],
        )
        .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        tx.commit().map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;

        let payload = serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null);
        Ok(Some(Job {
            id,
            queue: queue.to_string(),
            task_name,
            payload,
            priority,
            retry_count,
        }))
    }

    fn ack(&self, job_id: i64) -> Result<(), SchedulerError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM broker_jobs WHERE id = ?1", params![job_id])
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn nack(&self, job_id: i64, requeue: bool) -> Result<(), SchedulerError> {
        let conn = self.conn.lock().unwrap();
        if requeue {
            conn.execute(
                "UPDATE broker_jobs SET status = 'ready', invisible_until = NULL,
                 worker_id = NULL, retry_count = retry_count + 1 WHERE id = ?1",
                params![job_id],
            )
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        } else {
            conn.execute("DELETE FROM broker_jobs WHERE id = ?1", params![job_id])
                .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    fn queue_len(&self, queue: &str) -> Result<u64, SchedulerError> {
        Self::validate_queue(queue)?;
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM broker_jobs WHERE queue = ?1 AND status != 'done'",
                params![queue],
                |row| row.get(0),
            )
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        Ok(count as u64)
    }

    fn reclaim_expired_leases(&self) -> Result<usize, SchedulerError> {
        let conn = self.conn.lock().unwrap();
        requeue_expired_leases(&conn)
    }
}

/// Sweeps leased jobs whose visibility timeout has expired back to `ready`, enabling
/// at-least-once redelivery for workers that crashed or were killed mid-job.
pub fn requeue_expired_leases(conn: &Connection) -> Result<usize, SchedulerError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE broker_jobs SET status = 'ready', invisible_until = NULL, worker_id = NULL
         WHERE status = 'leased' AND invisible_until IS NOT NULL AND invisible_until <= ?1",
        params![now],
    )
    .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_rejects_unknown_queue() {
        let broker = SqliteBroker::open_in_memory().unwrap();
        let err = broker
            .enqueue("not_a_queue", "x", serde_json::json!({}), None, None)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoSuchQueue(_)));
    }

    #[test]
    fn enqueue_dequeue_ack_removes_job_exactly_once() {
        let broker = SqliteBroker::open_in_memory().unwrap();
        broker
            .enqueue("ai_tasks", "process_due_ai_tasks", serde_json::json!({}), None, None)
            .unwrap();

        let job = broker
            .dequeue("ai_tasks", "w1", StdDuration::from_secs(30))
            .unwrap()
            .unwrap();
        assert_eq!(job.task_name, "process_due_ai_tasks");
        assert_eq!(job.priority, 10);

        assert!(broker.dequeue("ai_tasks", "w2", StdDuration::from_secs(30)).unwrap().is_none());
        broker.ack(job.id).unwrap();
        assert_eq!(broker.queue_len("ai_tasks").unwrap(), 0);
    }

    #[test]
    fn nack_with_requeue_makes_job_visible_again() {
        let broker = SqliteBroker::open_in_memory().unwrap();
        broker
            .enqueue("email_tasks", "send_email", serde_json::json!({}), None, None)
            .unwrap();
        let job = broker
            .dequeue("email_tasks", "w1", StdDuration::from_secs(30))
            .unwrap()
            .unwrap();
        broker.nack(job.id, true).unwrap();

        let redelivered = broker
            .dequeue("email_tasks", "w2", StdDuration::from_secs(30))
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.retry_count, 1);
    }

    #[test]
    fn priority_beats_insertion_order() {
        let broker = SqliteBroker::open_in_memory().unwrap();
        broker
            .enqueue("maintenance_tasks", "low", serde_json::json!({}), Some(1), None)
            .unwrap();
        broker
            .enqueue("maintenance_tasks", "high", serde_json::json!({}), Some(50), None)
            .unwrap();
        let job = broker
            .dequeue("maintenance_tasks", "w1", StdDuration::from_secs(30))
            .unwrap()
            .unwrap();
        assert_eq!(job.task_name, "high");
    }

    #[test]
    fn reclaim_expired_leases_redelivers_through_the_public_api() {
        let broker = SqliteBroker::open_in_memory().unwrap();
        broker
            .enqueue("ai_tasks", "process_due_ai_tasks", serde_json::json!({}), None, None)
            .unwrap();

        let leased = broker
            .dequeue("ai_tasks", "w1", StdDuration::from_millis(0))
            .unwrap()
            .unwrap();
        assert!(broker.dequeue("ai_tasks", "w2", StdDuration::from_secs(30)).unwrap().is_none());

        std::thread::sleep(StdDuration::from_millis(5));
        let reclaimed = broker.reclaim_expired_leases().unwrap();
        assert_eq!(reclaimed, 1);

        let redelivered = broker
            .dequeue("ai_tasks", "w2", StdDuration::from_secs(30))
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.id, leased.id);
    }
}
