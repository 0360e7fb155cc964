//! Rule-based evaluation of metrics into alerts, dispatched through per-channel
//! adapters with cooldown gating.
//!
//! Grounded on `workers/utils/alerting.py::AlertManager`: the same five default rules
//! (`high_task_failure_rate`, `critical_task_failure_rate`, `high_memory_usage`,
//! `high_cpu_usage`, `queue_backlog`) with identical thresholds/windows/channels, the
//! cooldown-then-evaluate loop, and per-channel dispatch where one channel's failure
//! never aborts the others.

use chrono::{DateTime, Duration, Utc};
use scheduler_core::defaults::*;
use scheduler_core::model::{Alert, AlertChannel, AlertCondition, AlertRule, AlertSeverity};
use std::collections::HashMap;
use std::sync::Mutex;

/// Side-effecting delivery adapter for one channel. Failures are caught by
/// `AlertManager::check_alerts` and never abort dispatch to the remaining channels.
pub trait AlertSink: Send + Sync {
    fn send(&self, channel: AlertChannel, alert: &Alert) -> Result<(), String>;
}

/// Logs via `tracing` and prints to stdout; the two channels every deployment gets for
/// free, matching the teacher's always-on `LOG`/`CONSOLE` sinks.
pub struct LogConsoleSink;

impl AlertSink for LogConsoleSink {
    fn send(&self, channel: AlertChannel, alert: &Alert) -> Result<(), String> {
        match channel {
            AlertChannel::Log => {
                tracing::warn!(rule = %alert.rule_name, severity = ?alert.severity, "{}", alert.message);
                Ok(())
            }
            AlertChannel::Console => {
                println!("[{:?}] {}: {}", alert.severity, alert.rule_name, alert.message);
                Ok(())
            }
            other => Err(format!("LogConsoleSink cannot handle {other:?}")),
        }
    }
}

/// Current readings an `AlertRule` can be evaluated against.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub task_failure_rate: Option<f64>,
    pub memory_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub queue_lengths: HashMap<String, u64>,
}

struct Inner {
    rules: Vec<AlertRule>,
    active: Vec<Alert>,
    history: Vec<Alert>,
    next_id: u64,
}

pub struct AlertManager {
    inner: Mutex<Inner>,
    sinks: HashMap<AlertChannel, Box<dyn AlertSink>>,
}

impl AlertManager {
    pub fn new(sinks: HashMap<AlertChannel, Box<dyn AlertSink>>) -> Self {
        AlertManager {
            inner: Mutex::new(Inner {
                rules: default_rules(),
                active: Vec::new(),
                history: Vec::new(),
                next_id: 1,
            }),
            sinks,
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        let mut inner = self.inner.lock().unwrap();
        inner.rules.retain(|r| r.name != rule.name);
        inner.rules.push(rule);
    }

    pub fn remove_rule(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.rules.retain(|r| r.name != name);
    }

    /// Evaluates every enabled rule against `snapshot`; fires, records, and dispatches
    /// any that exceed their threshold outside their cooldown window.
    pub fn check_alerts(&self, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> Vec<Alert> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let rules_snapshot: Vec<usize> = (0..inner.rules.len()).collect();

        for idx in rules_snapshot {
            let (should_fire, value) = {
                let rule = &inner.rules[idx];
                if !rule.enabled {
                    continue;
                }
                if let Some(last) = rule.last_triggered {
                    if now - last < rule.cooldown {
                        continue;
                    }
                }
                evaluate_condition(rule, snapshot)
            };
            if !should_fire {
                continue;
            }

            let id = {
                let n = inner.next_id;
                inner.next_id += 1;
                format!("alert_{n}_{}", now.timestamp())
            };
            let rule = &mut inner.rules[idx];
            let message = format_message(&rule.message_template, rule.condition, value, snapshot);
            let alert = Alert {
                id,
                rule_name: rule.name.clone(),
                severity: rule.severity,
                message,
                timestamp: now,
                metadata: HashMap::new(),
                acknowledged: false,
                acknowledged_by: None,
                acknowledged_at: None,
            };
            rule.last_triggered = Some(now);
            let channels = rule.channels.clone();

            inner.active.push(alert.clone());
            inner.history.push(alert.clone());
            fired.push(alert.clone());

            for channel in channels {
                if let Some(sink) = self.sinks.get(&channel) {
                    if let Err(e) = sink.send(channel, &alert) {
                        tracing::error!(channel = ?channel, error = %e, "alert channel failed");
                    }
                }
            }
        }
        fired
    }

    pub fn acknowledge(&self, alert_id: &str, user: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(alert) = inner.active.iter_mut().find(|a| a.id == alert_id) {
            if !alert.acknowledged {
                alert.acknowledged = true;
                alert.acknowledged_by = Some(user.to_string());
                alert.acknowledged_at = Some(now);
            }
        }
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner.lock().unwrap().active.clone()
    }

    pub fn cleanup_old_alerts(&self, max_age: Duration, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.retain(|a| now - a.timestamp < max_age);
        inner.active.retain(|a| now - a.timestamp < max_age);
    }
}

fn evaluate_condition(rule: &AlertRule, snapshot: &MetricsSnapshot) -> (bool, f64) {
    match rule.condition {
        AlertCondition::TaskFailureRate => {
            let rate = snapshot.task_failure_rate.unwrap_or(0.0);
            (rate >= rule.threshold, rate)
        }
        AlertCondition::MemoryUsage => {
            let pct = snapshot.memory_percent.unwrap_or(0.0);
            (pct >= rule.threshold, pct)
        }
        AlertCondition::CpuUsage => {
            let pct = snapshot.cpu_percent.unwrap_or(0.0);
            (pct >= rule.threshold, pct)
        }
        AlertCondition::QueueLength => {
            let max_len = snapshot.queue_lengths.values().copied().max().unwrap_or(0) as f64;
            (max_len >= rule.threshold, max_len)
        }
        AlertCondition::SystemIssue => (false, 0.0),
    }
}

fn format_message(template: &str, condition: AlertCondition, value: f64, snapshot: &MetricsSnapshot) -> String {
    let mut message = template.to_string();
    match condition {
        AlertCondition::TaskFailureRate => {
            message = message.replace("{rate}", &format!("{:.1}%", value * 100.0));
        }
        AlertCondition::MemoryUsage => {
            message = message.replace("{memory_percent}", &format!("{:.1}", value * 100.0));
        }
        AlertCondition::CpuUsage => {
            message = message.replace("{cpu_percent}", &format!("{:.1}", value * 100.0));
        }
        AlertCondition::QueueLength => {
            let queue_name = snapshot
                .queue_lengths
                .iter()
                .max_by_key(|(_, &len)| len)
                .map(|(name, _)| name.as_str())
                .unwrap_or("unknown");
            message = message
                .replace("{queue_length}", &value.to_string())
                .replace("{queue_name}", queue_name);
        }
        AlertCondition::SystemIssue => {}
    }
    message
}

/// Grounded on `_initialize_default_rules`: five rules present in every fresh manager
/// unless explicitly suppressed.
pub fn default_rules() -> Vec<AlertRule> {
    let window = Duration::seconds(HIGH_USAGE_ALERT_WINDOW_SECS);
    let cooldown = Duration::seconds(DEFAULT_ALERT_COOLDOWN_SECS);
    vec![
        AlertRule {
            name: "high_task_failure_rate".into(),
            condition: AlertCondition::TaskFailureRate,
            threshold: HIGH_FAILURE_RATE_THRESHOLD,
            window,
            channels: vec![AlertChannel::Log, AlertChannel::Console],
            severity: AlertSeverity::Warning,
            message_template: "Task failure rate is {rate} over the last window".into(),
            enabled: true,
            cooldown,
            last_triggered: None,
        },
        AlertRule {
            name: "critical_task_failure_rate".into(),
            condition: AlertCondition::TaskFailureRate,
            threshold: CRITICAL_FAILURE_RATE_THRESHOLD,
            window,
            channels: vec![AlertChannel::Log, AlertChannel::Console, AlertChannel::Email],
            severity: AlertSeverity::Critical,
            message_template: "CRITICAL task failure rate: {rate}".into(),
            enabled: true,
            cooldown,
            last_triggered: None,
        },
        AlertRule {
            name: "high_memory_usage".into(),
            condition: AlertCondition::MemoryUsage,
            threshold: HIGH_MEMORY_THRESHOLD,
            window,
            channels: vec![AlertChannel::Log, AlertChannel::Console],
            severity: AlertSeverity::Warning,
            message_template: "Memory usage at {memory_percent}%".into(),
            enabled: true,
            cooldown,
            last_triggered: None,
        },
        AlertRule {
            name: "high_cpu_usage".into(),
            condition: AlertCondition::CpuUsage,
            threshold: HIGH_CPU_THRESHOLD,
            window,
            channels: vec![AlertChannel::Log, AlertChannel::Console],
            severity: AlertSeverity::Warning,
            message_template: "CPU usage at {cpu_percent}%".into(),
            enabled: true,
            cooldown,
            last_triggered: None,
        },
        AlertRule {
            name: "queue_backlog".into(),
            condition: AlertCondition::QueueLength,
            threshold: QUEUE_BACKLOG_THRESHOLD,
            window,
            channels: vec![AlertChannel::Log, AlertChannel::Console],
            severity: AlertSeverity::Warning,
            message_template: "Queue {queue_name} has {queue_length} pending jobs".into(),
            enabled: true,
            cooldown,
            last_triggered: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AlertManager {
        let mut sinks: HashMap<AlertChannel, Box<dyn AlertSink>> = HashMap::new();
        sinks.insert(AlertChannel::Log, Box::new(LogConsoleSink));
        sinks.insert(AlertChannel::Console, Box::new(LogConsoleSink));
        AlertManager::new(sinks)
    }

    #[test]
    fn fresh_manager_has_all_five_default_rules() {
        let manager = manager();
        assert_eq!(manager.inner.lock().unwrap().rules.len(), 5);
    }

    #[test]
    fn high_failure_rate_fires_and_respects_cooldown() {
        let manager = manager();
        let now = Utc::now();
        let snapshot = MetricsSnapshot {
            task_failure_rate: Some(0.5),
            ..Default::default()
        };
        let fired = manager.check_alerts(&snapshot, now);
        assert_eq!(fired.len(), 2, "both failure-rate rules should fire");

        let fired_again = manager.check_alerts(&snapshot, now + Duration::seconds(10));
        assert!(fired_again.is_empty(), "cooldown should suppress immediate refiring");
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let manager = manager();
        let now = Utc::now();
        let snapshot = MetricsSnapshot {
            memory_percent: Some(0.95),
            ..Default::default()
        };
        let fired = manager.check_alerts(&snapshot, now);
        let id = fired[0].id.clone();
        manager.acknowledge(&id, "alice", now);
        manager.acknowledge(&id, "bob", now);
        let active = manager.active_alerts();
        let alert = active.iter().find(|a| a.id == id).unwrap();
        assert_eq!(alert.acknowledged_by.as_deref(), Some("alice"));
    }

    #[test]
    fn queue_backlog_message_names_the_offending_queue() {
        let manager = manager();
        let mut queue_lengths = HashMap::new();
        queue_lengths.insert("ai_tasks".to_string(), 150u64);
        let snapshot = MetricsSnapshot {
            queue_lengths,
            ..Default::default()
        };
        let fired = manager.check_alerts(&snapshot, Utc::now());
        assert_eq!(fired.len(), 1);
        assert!(fired[0].message.contains("ai_tasks"));
        assert!(fired[0].message.contains("150"));
    }
}
