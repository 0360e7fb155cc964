//! Single-instance timer producing periodic dispatch triggers.
//!
//! Grounded on the staggered-ticker mechanism in `agent/src/main.rs` (one
//! `tokio::time::interval` per configured check, jittered so they don't all fire at
//! once), generalised from fixed-interval polling to minute-resolution cron-field
//! evaluation so each Beat entry can declare its own schedule independently.

use chrono::{DateTime, Timelike, Utc};
use scheduler_core::broker::Broker;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// One seed job the Beat emits on its own cron schedule.
#[derive(Debug, Clone)]
pub struct BeatEntry {
    pub job_name: String,
    pub queue: String,
    pub priority: i32,
    pub schedule: CronField,
    last_tick: Arc<AtomicI64>,
}

/// A minimal cron-field matcher covering the schedules SPEC_FULL §6 names: "every
/// minute", "daily at HH:MM", "hourly at :MM", "every N hours at :00", and "weekly on a
/// given weekday at HH:MM". Not a general cron parser; the Beat schedule is fixed and
/// small enough that naming the cases directly is clearer than a full expression engine.
#[derive(Debug, Clone, Copy)]
pub enum CronField {
    EveryMinute,
    Daily { hour: u32, minute: u32 },
    HourlyAt { minute: u32 },
    EveryNHours { n: u32, minute: u32 },
    Weekly { weekday: u32, hour: u32, minute: u32 },
}

impl CronField {
    fn matches(&self, now: DateTime<Utc>) -> bool {
        use chrono::Datelike;
        match *self {
            CronField::EveryMinute => true,
            CronField::Daily { hour, minute } => now.hour() == hour && now.minute() == minute,
            CronField::HourlyAt { minute } => now.minute() == minute,
            CronField::EveryNHours { n, minute } => now.minute() == minute && now.hour() % n == 0,
            CronField::Weekly { weekday, hour, minute } => {
                now.weekday().num_days_from_monday() == weekday && now.hour() == hour && now.minute() == minute
            }
        }
    }
}

impl BeatEntry {
    pub fn new(job_name: impl Into<String>, queue: impl Into<String>, priority: i32, schedule: CronField) -> Self {
        BeatEntry {
            job_name: job_name.into(),
            queue: queue.into(),
            priority,
            schedule,
            last_tick: Arc::new(AtomicI64::new(0)),
        }
    }
}

/// Grounded on SPEC_FULL §6's Beat schedule table.
pub fn default_entries() -> Vec<BeatEntry> {
    vec![
        BeatEntry::new(
            "process_due_ai_tasks",
            "ai_tasks",
            10,
            CronField::EveryMinute,
        ),
        BeatEntry::new(
            "cleanup_old_logs",
            "maintenance_tasks",
            1,
            CronField::Daily { hour: 2, minute: 0 },
        ),
        BeatEntry::new(
            "sync_calendar_events",
            "sync_tasks",
            7,
            CronField::HourlyAt { minute: 0 },
        ),
        BeatEntry::new(
            "sync_notion_pages",
            "sync_tasks",
            7,
            CronField::EveryNHours { n: 2, minute: 0 },
        ),
        BeatEntry::new(
            "optimize_database",
            "maintenance_tasks",
            1,
            CronField::Weekly { weekday: 6, hour: 3, minute: 0 },
        ),
        BeatEntry::new(
            "cleanup_old_sessions",
            "maintenance_tasks",
            1,
            CronField::Daily { hour: 4, minute: 0 },
        ),
    ]
}

/// Polls once per second (well inside the +-5s drift budget) and fires any entry whose
/// schedule matches the current minute and hasn't already ticked this minute.
pub struct Beat {
    entries: Vec<BeatEntry>,
    broker: Arc<dyn Broker>,
}

impl Beat {
    pub fn new(entries: Vec<BeatEntry>, broker: Arc<dyn Broker>) -> Self {
        Beat { entries, broker }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
            }
        }
    }

    fn tick(&self, now: DateTime<Utc>) {
        let minute_bucket = now.timestamp() / 60;
        for entry in &self.entries {
            if !entry.schedule.matches(now) {
                continue;
            }
            if entry.last_tick.load(Ordering::SeqCst) == minute_bucket {
                continue;
            }
            entry.last_tick.store(minute_bucket, Ordering::SeqCst);
            let result = self.broker.enqueue(
                &entry.queue,
                &entry.job_name,
                serde_json::json!({ "job": entry.job_name }),
                Some(entry.priority),
                None,
            );
            if let Err(e) = result {
                tracing::error!(job = %entry.job_name, error = %e.to_string(), "beat failed to enqueue job");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn default_entries_cover_the_named_beat_schedule() {
        let entries = default_entries();
        let names: Vec<&str> = entries.iter().map(|e| e.job_name.as_str()).collect();
        assert!(names.contains(&"process_due_ai_tasks"));
        assert!(names.contains(&"optimize_database"));
        assert_eq!(entries.len(), 6);
    }

    #[test]
    fn every_minute_matches_any_instant() {
        assert!(CronField::EveryMinute.matches(dt(2025, 1, 1, 13, 37)));
    }

    #[test]
    fn daily_only_matches_its_hour_and_minute() {
        let field = CronField::Daily { hour: 2, minute: 0 };
        assert!(field.matches(dt(2025, 1, 1, 2, 0)));
        assert!(!field.matches(dt(2025, 1, 1, 2, 1)));
    }

    #[test]
    fn weekly_matches_sunday_at_0300() {
        // 2025-06-08 is a Sunday.
        let field = CronField::Weekly { weekday: 6, hour: 3, minute: 0 };
        assert!(field.matches(dt(2025, 6, 8, 3, 0)));
        assert!(!field.matches(dt(2025, 6, 9, 3, 0)));
    }

    #[test]
    fn tick_is_idempotent_within_the_same_minute() {
        let broker = Arc::new(scheduler_core::broker::SqliteBroker::open_in_memory().unwrap());
        let beat = Beat::new(
            vec![BeatEntry::new("process_due_ai_tasks", "ai_tasks", 10, CronField::EveryMinute)],
            broker.clone(),
        );
        let now = dt(2025, 1, 1, 0, 0);
        beat.tick(now);
        beat.tick(now + chrono::Duration::seconds(30));
        assert_eq!(broker.queue_len("ai_tasks").unwrap(), 1);
    }
}
