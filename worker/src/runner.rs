//! The `TaskRunner` port and its two adapters.
//!
//! Grounded on the teacher's task-handler trait (`agent/src/tasks.rs`'s per-task-type
//! dispatch) generalised to one abstract execution contract: concrete task *kinds*
//! (`reminder` vs `automated_task`/`periodic_task`) get distinct adapters rather than
//! distinct methods, matching SPEC_FULL §4.4's "concrete adapter invokes LLM agent" note
//! plus the open question recording that reminders need no LLM call at all.

use async_trait::async_trait;
use scheduler_core::AITask;
use serde_json::Value;
use std::collections::HashMap;

/// Outcome of one task execution. Never carries a Rust `Err`: runner failures are
/// reported as `success = false` so a bad LLM response can never crash a Worker slot.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    pub artefacts: HashMap<String, Value>,
    pub ai_response: Option<String>,
}

impl ExecutionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        ExecutionResult {
            success: true,
            message: message.into(),
            artefacts: HashMap::new(),
            ai_response: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionResult {
            success: false,
            message: message.into(),
            artefacts: HashMap::new(),
            ai_response: None,
        }
    }
}

/// Abstract contract for executing one `AITask`. Implementations MUST be cancel-safe:
/// dropping the future at an `.await` point must not corrupt task state, since the
/// Worker abandons runners that overrun their `soft_cancel_grace`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn execute(&self, task: &AITask) -> ExecutionResult;
}

/// Runs `reminder` tasks: no LLM call, the task's own title/description/ai_context is
/// already the message to deliver.
pub struct ReminderRunner;

#[async_trait]
impl TaskRunner for ReminderRunner {
    async fn execute(&self, task: &AITask) -> ExecutionResult {
        let message = match &task.description {
            Some(desc) if !desc.trim().is_empty() => format!("{}: {}", task.title, desc),
            _ => task.title.clone(),
        };
        ExecutionResult::ok(message)
    }
}

/// Composes a prompt from the task's fields and invokes an external LLM agent over
/// HTTP. Upstream failures (timeout, 5xx, malformed response) never propagate as an
/// `Err`; they become `success = false` with a diagnostic message, per SPEC_FULL §4.4.
pub struct LlmTaskRunner {
    client: reqwest::Client,
    endpoint: String,
}

impl LlmTaskRunner {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        LlmTaskRunner {
            client,
            endpoint: endpoint.into(),
        }
    }

    fn build_prompt(task: &AITask) -> String {
        let mut prompt = format!("Task: {}\n", task.title);
        if let Some(desc) = &task.description {
            prompt.push_str(&format!("Description: {desc}\n"));
        }
        if let Some(context) = &task.ai_context {
            prompt.push_str(&format!("Context: {context}\n"));
        }
        prompt
    }
}

#[async_trait]
impl TaskRunner for LlmTaskRunner {
    async fn execute(&self, task: &AITask) -> ExecutionResult {
        let prompt = Self::build_prompt(task);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "prompt": prompt, "task_id": task.id }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return ExecutionResult::failed(format!("LLM request failed: {e}")),
        };

        if !response.status().is_success() {
            return ExecutionResult::failed(format!(
                "LLM agent returned status {}",
                response.status()
            ));
        }

        match response.json::<serde_json::Value>().await {
            Ok(body) => {
                let ai_response = body
                    .get("response")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                match ai_response {
                    Some(text) => ExecutionResult {
                        success: true,
                        message: "task executed by LLM agent".to_string(),
                        artefacts: HashMap::new(),
                        ai_response: Some(text),
                    },
                    None => ExecutionResult::failed("LLM agent response missing `response` field"),
                }
            }
            Err(e) => ExecutionResult::failed(format!("malformed LLM response: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::{ScheduleConfig, TaskKind, TaskStatus};
    use chrono::Utc;

    fn sample_task(description: Option<&str>) -> AITask {
        AITask {
            id: 1,
            user_id: 1,
            title: "Take vitamins".into(),
            description: description.map(|s| s.to_string()),
            task_type: TaskKind::Reminder,
            schedule_type: scheduler_core::ScheduleType::Once,
            schedule_config: ScheduleConfig::Once { run_at: Utc::now() },
            next_run_at: None,
            last_run_at: None,
            status: TaskStatus::Processing,
            ai_context: None,
            notification_channels: vec!["sms".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reminder_runner_echoes_title_and_description() {
        let runner = ReminderRunner;
        let result = runner.execute(&sample_task(Some("with breakfast"))).await;
        assert!(result.success);
        assert_eq!(result.message, "Take vitamins: with breakfast");
    }

    #[tokio::test]
    async fn reminder_runner_falls_back_to_title_only() {
        let runner = ReminderRunner;
        let result = runner.execute(&sample_task(None)).await;
        assert_eq!(result.message, "Take vitamins");
    }
}
