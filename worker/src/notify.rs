//! Multi-channel notification delivery with per-channel retry and truncation rules.
//!
//! Grounded on `tools/ai_scheduler/notification_service.py::NotificationService`: the
//! `"[AI Task: {title}]\n\n{message}"` SMS formatting, the 1500-code-point truncation
//! with a logged warning, and Twilio credentials read from `TWILIO_ACCOUNT_SID` /
//! `TWILIO_AUTH_TOKEN` / `TWILIO_FROM_NUMBER`.

use async_trait::async_trait;
use scheduler_core::config::TwilioConfig;
use scheduler_core::defaults::TWILIO_SMS_MAX_CHARS;
use std::collections::HashMap;
use std::time::Duration;

/// Result of sending through one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(String),
    Failure(String),
}

/// One delivery channel. Unavailable channels (no credentials at startup) yield a
/// synthetic failure without any network I/O.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    async fn send(&self, message: &str, context: &HashMap<String, String>) -> Outcome;
}

/// SMS adapter: formats, truncates, and retries transient 5xx responses.
pub struct SmsChannel {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl SmsChannel {
    pub fn new(client: reqwest::Client, config: TwilioConfig) -> Self {
        SmsChannel { client, config }
    }

    /// `"[AI Task: {title}]\n\n{message}"` when a title is present, else the bare
    /// message; truncated to `TWILIO_SMS_MAX_CHARS` code points with a `"..."` suffix.
    pub fn format_body(title: Option<&str>, message: &str) -> (String, bool) {
        let body = match title {
            Some(t) if !t.is_empty() => format!("[AI Task: {t}]\n\n{message}"),
            _ => message.to_string(),
        };
        let char_count = body.chars().count();
        if char_count <= TWILIO_SMS_MAX_CHARS {
            (body, false)
        } else {
            let truncated: String = body.chars().take(TWILIO_SMS_MAX_CHARS.saturating_sub(3)).collect();
            (format!("{truncated}..."), true)
        }
    }
}

const SMS_RETRY_BACKOFFS_MS: [u64; 3] = [1000, 2000, 4000];

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn is_available(&self) -> bool {
        self.config.is_configured()
    }

    async fn send(&self, message: &str, context: &HashMap<String, String>) -> Outcome {
        if !self.is_available() {
            return Outcome::Failure("sms channel not configured".into());
        }
        let to = match context.get("phone") {
            Some(phone) => phone.clone(),
            None => return Outcome::Failure("no phone number on context".into()),
        };
        let title = context.get("title").map(|s| s.as_str());
        let (body, truncated) = Self::format_body(title, message);
        if truncated {
            tracing::warn!(to = %to, "SMS body truncated to {TWILIO_SMS_MAX_CHARS} characters");
        }

        let from = self.config.from_number.clone().unwrap_or_default();
        for (attempt, backoff_ms) in SMS_RETRY_BACKOFFS_MS.iter().enumerate() {
            let response = self
                .client
                .post("https://api.twilio.com/2010-04-01/Messages.json")
                .basic_auth(
                    self.config.account_sid.clone().unwrap_or_default(),
                    self.config.auth_token.clone(),
                )
                .form(&[("To", to.as_str()), ("From", from.as_str()), ("Body", body.as_str())])
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return Outcome::Success(format!("sms-{}", resp.status()));
                }
                Ok(resp) if resp.status().is_server_error() && attempt + 1 < SMS_RETRY_BACKOFFS_MS.len() => {
                    tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                    continue;
                }
                Ok(resp) => {
                    return Outcome::Failure(format!("twilio returned {}", resp.status()));
                }
                Err(e) => {
                    if attempt + 1 < SMS_RETRY_BACKOFFS_MS.len() {
                        tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                        continue;
                    }
                    return Outcome::Failure(format!("sms request failed: {e}"));
                }
            }
        }
        Outcome::Failure("sms delivery exhausted retries".into())
    }
}

/// In-app notifications and email are specified as ports only; this adapter is the
/// pluggable default that always reports itself unavailable until a real one is wired
/// in, matching SPEC_FULL §4.3's "ports only" note for non-SMS channels.
pub struct UnconfiguredChannel {
    pub channel_name: &'static str,
}

#[async_trait]
impl NotificationChannel for UnconfiguredChannel {
    fn name(&self) -> &'static str {
        self.channel_name
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn send(&self, _message: &str, _context: &HashMap<String, String>) -> Outcome {
        Outcome::Failure(format!("{} channel not configured", self.channel_name))
    }
}

/// Fans a message out across every named channel, returning one `Outcome` per channel.
/// Overall success is "at least one channel succeeded".
pub struct NotificationDispatcher {
    channels: HashMap<String, Box<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new(channels: HashMap<String, Box<dyn NotificationChannel>>) -> Self {
        NotificationDispatcher { channels }
    }

    pub async fn send(
        &self,
        requested: &[String],
        message: &str,
        context: &HashMap<String, String>,
    ) -> HashMap<String, Outcome> {
        let mut results = HashMap::new();
        for name in requested {
            let outcome = match self.channels.get(name) {
                Some(channel) if channel.is_available() => channel.send(message, context).await,
                Some(channel) => Outcome::Failure(format!("{} channel unavailable", channel.name())),
                None => Outcome::Failure(format!("unknown channel: {name}")),
            };
            results.insert(name.clone(), outcome);
        }
        results
    }

    pub fn any_succeeded(results: &HashMap<String, Outcome>) -> bool {
        results.values().any(|o| matches!(o, Outcome::Success(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_body_includes_title_marker() {
        let (body, truncated) = SmsChannel::format_body(Some("Take meds"), "It's time");
        assert_eq!(body, "[AI Task: Take meds]\n\nIt's time");
        assert!(!truncated);
    }

    #[test]
    fn format_body_truncates_long_messages() {
        let long_message = "x".repeat(2000);
        let (body, truncated) = SmsChannel::format_body(None, &long_message);
        assert!(truncated);
        assert_eq!(body.chars().count(), TWILIO_SMS_MAX_CHARS);
        assert!(body.ends_with("..."));
    }

    #[tokio::test]
    async fn unconfigured_channel_fails_without_network_io() {
        let channel = UnconfiguredChannel { channel_name: "email" };
        let outcome = channel.send("hi", &HashMap::new()).await;
        assert!(matches!(outcome, Outcome::Failure(_)));
    }

    #[tokio::test]
    async fn dispatcher_succeeds_if_any_channel_succeeds() {
        let mut channels: HashMap<String, Box<dyn NotificationChannel>> = HashMap::new();
        channels.insert("email".into(), Box::new(UnconfiguredChannel { channel_name: "email" }));
        let dispatcher = NotificationDispatcher::new(channels);
        let results = dispatcher
            .send(&["email".to_string(), "unknown_channel".to_string()], "hi", &HashMap::new())
            .await;
        assert!(!NotificationDispatcher::any_succeeded(&results));
        assert_eq!(results.len(), 2);
    }
}
