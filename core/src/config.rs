//! Environment-driven configuration, read once at process start by the Orchestrator.
//!
//! Every field here corresponds to one environment variable named in SPEC_FULL §6.
//! Parsing follows the teacher's pattern: read the raw string, fall back to a named
//! default from `defaults`, and fail fast with `SchedulerError::InvalidSpec` on a value
//! that parses to the wrong type rather than silently ignoring it.

use crate::defaults::*;
use crate::error::SchedulerError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout: Duration,
    pub pool_recycle: Duration,
    pub pool_pre_ping: bool,
    pub slow_query_threshold: Duration,
    pub health_check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AlertingConfig {
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_email: Option<String>,
    pub to_emails: Vec<String>,
    pub slack_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
}

impl TwilioConfig {
    pub fn is_configured(&self) -> bool {
        self.account_sid.is_some() && self.auth_token.is_some() && self.from_number.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub graceful_shutdown_timeout: Duration,
    pub max_tasks_per_child: u32,
    pub task_timeout: Duration,
    pub soft_cancel_grace: Duration,
    pub retry_base_secs: i64,
    pub retry_max_secs: i64,
    pub retry_max_attempts: u32,
    pub queue_warning_length: u64,
    pub queue_block_length: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub broker_url: String,
    pub result_backend_url: String,
    pub alerting: AlertingConfig,
    pub twilio: TwilioConfig,
    pub worker: WorkerConfig,
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, SchedulerError> {
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| SchedulerError::InvalidSpec(format!("{key} is not valid: {raw}"))),
    }
}

fn env_required(key: &str) -> Result<String, SchedulerError> {
    env_opt(key).ok_or_else(|| SchedulerError::InvalidSpec(format!("{key} is required")))
}

impl Config {
    /// Reads the full configuration from the process environment.
    pub fn from_env() -> Result<Config, SchedulerError> {
        let database = DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            pool_size: env_parsed("DB_POOL_SIZE", 20)?,
            max_overflow: env_parsed("DB_MAX_OVERFLOW", 30)?,
            pool_timeout: Duration::from_secs(env_parsed("DB_POOL_TIMEOUT", 30)?),
            pool_recycle: Duration::from_secs(env_parsed("DB_POOL_RECYCLE", 3600)?),
            pool_pre_ping: env_parsed("DB_POOL_PRE_PING", true)?,
            slow_query_threshold: Duration::from_secs_f64(env_parsed(
                "DB_SLOW_QUERY_THRESHOLD",
                0.1,
            )?),
            health_check_interval: Duration::from_secs(env_parsed(
                "DB_HEALTH_CHECK_INTERVAL",
                30,
            )?),
        };

        let alerting = AlertingConfig {
            smtp_server: env_opt("ALERT_SMTP_SERVER"),
            smtp_port: env_parsed("ALERT_SMTP_PORT", 587)?,
            smtp_username: env_opt("ALERT_SMTP_USERNAME"),
            smtp_password: env_opt("ALERT_SMTP_PASSWORD"),
            from_email: env_opt("ALERT_FROM_EMAIL"),
            to_emails: env_opt("ALERT_TO_EMAILS")
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            slack_webhook_url: env_opt("ALERT_SLACK_WEBHOOK_URL"),
            webhook_url: env_opt("ALERT_WEBHOOK_URL"),
        };

        let twilio = TwilioConfig {
            account_sid: env_opt("TWILIO_ACCOUNT_SID"),
            auth_token: env_opt("TWILIO_AUTH_TOKEN"),
            from_number: env_opt("TWILIO_FROM_NUMBER"),
        };

        let worker = WorkerConfig {
            concurrency: env_parsed("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)?,
            graceful_shutdown_timeout: Duration::from_secs(env_parsed(
                "GRACEFUL_SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS,
            )?),
            max_tasks_per_child: env_parsed("MAX_TASKS_PER_CHILD", DEFAULT_MAX_TASKS_PER_CHILD)?,
            task_timeout: Duration::from_secs(env_parsed(
                "TASK_TIMEOUT_SECS",
                DEFAULT_TASK_TIMEOUT_SECS,
            )?),
            soft_cancel_grace: Duration::from_secs(env_parsed(
                "SOFT_CANCEL_GRACE_SECS",
                DEFAULT_SOFT_CANCEL_GRACE_SECS,
            )?),
            retry_base_secs: env_parsed("RETRY_BASE_SECS", DEFAULT_RETRY_BASE_SECS)?,
            retry_max_secs: env_parsed("RETRY_MAX_SECS", DEFAULT_RETRY_MAX_SECS)?,
            retry_max_attempts: env_parsed("RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS)?,
            queue_warning_length: env_parsed(
                "QUEUE_WARNING_LENGTH",
                DEFAULT_QUEUE_WARNING_LENGTH,
            )?,
            queue_block_length: env_parsed("QUEUE_BLOCK_LENGTH", DEFAULT_QUEUE_BLOCK_LENGTH)?,
        };

        Ok(Config {
            database,
            broker_url: env_required("BROKER_URL")?,
            result_backend_url: env_opt("RESULT_BACKEND_URL").unwrap_or_default(),
            alerting,
            twilio,
            worker,
        })
    }

    /// Content hash of the effective configuration, exposed via the health endpoint so
    /// operators can confirm every instance in a deployment is running the same config,
    /// mirroring the teacher's config-reload checksum.
    pub fn checksum(&self) -> String {
        crate::utils::checksum(format!("{self:?}").as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_required_var_is_reported() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("DATABASE_URL");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSpec(_)));
    }

    #[test]
    fn defaults_fill_in_when_vars_are_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DATABASE_URL", "sqlite://test.db");
        env::set_var("BROKER_URL", "memory://");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.worker.concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert_eq!(cfg.database.pool_size, 20);
        env::remove_var("DATABASE_URL");
        env::remove_var("BROKER_URL");
    }

    #[test]
    fn checksum_changes_when_config_changes() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("DATABASE_URL", "sqlite://test.db");
        env::set_var("BROKER_URL", "memory://");
        let a = Config::from_env().unwrap();
        env::set_var("WORKER_CONCURRENCY", "9");
        let b = Config::from_env().unwrap();
        assert_ne!(a.checksum(), b.checksum());
        env::remove_var("DATABASE_URL");
        env::remove_var("BROKER_URL");
        env::remove_var("WORKER_CONCURRENCY");
    }
}
