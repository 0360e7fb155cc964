//! Small shared helpers: checksums, retry backoff, and validation guards.

use crate::defaults::{DEFAULT_RETRY_BASE_SECS, DEFAULT_RETRY_MAX_SECS};
use crate::error::SchedulerError;
use chrono::Duration;

/// Content hash used to detect whether a persisted config blob actually changed before
/// writing it back out, the same way the teacher hashes agent config before reload.
pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Exponential backoff: `base * 2^retry_count`, capped at `max`. Generalises the
/// teacher's `2^retry_count` minutes (capped at 60) to configurable base/cap seconds.
pub fn retry_backoff(retry_count: u32, base_secs: i64, max_secs: i64) -> Duration {
    let scaled = base_secs.saturating_mul(1i64 << retry_count.min(20));
    Duration::seconds(scaled.min(max_secs))
}

/// Backoff using the crate-wide default base/cap.
pub fn default_retry_backoff(retry_count: u32) -> Duration {
    retry_backoff(retry_count, DEFAULT_RETRY_BASE_SECS, DEFAULT_RETRY_MAX_SECS)
}

/// Rejects blank or whitespace-only titles before they reach the store.
pub fn require_non_blank(field: &str, value: &str) -> Result<(), SchedulerError> {
    if value.trim().is_empty() {
        return Err(SchedulerError::InvalidSpec(format!("{field} must not be blank")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_for_the_same_input() {
        assert_eq!(checksum(b"hello"), checksum(b"hello"));
        assert_ne!(checksum(b"hello"), checksum(b"world"));
    }

    #[test]
    fn backoff_doubles_and_then_caps() {
        assert_eq!(retry_backoff(0, 60, 3600), Duration::seconds(60));
        assert_eq!(retry_backoff(1, 60, 3600), Duration::seconds(120));
        assert_eq!(retry_backoff(10, 60, 3600), Duration::seconds(3600));
    }

    #[test]
    fn blank_title_is_rejected() {
        assert!(require_non_blank("title", "   ").is_err());
        assert!(require_non_blank("title", "ok").is_ok());
    }
}
