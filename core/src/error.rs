//! The closed error taxonomy surfaced by every component of the scheduling core.

/// Result type alias used throughout the core crate and its dependents.
pub type Result<T> = anyhow::Result<T>;

/// Errors a caller of the scheduling core can pattern-match on.
///
/// This is the union of every failure mode named in the error-handling design: store
/// and broker outages, dependency-graph rejections, timeouts, and channel failures all
/// reduce to one of these variants before crossing a component boundary.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("cycle detected in dependency graph")]
    CycleDetected,

    #[error("operation timed out: {0}")]
    TimedOut(String),

    #[error("queue is full: {0}")]
    QueueFull(String),

    #[error("no such queue: {0}")]
    NoSuchQueue(String),

    #[error("notification channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("permanent upstream error: {0}")]
    PermanentUpstream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            SchedulerError::CycleDetected.to_string(),
            "cycle detected in dependency graph"
        );
        assert_eq!(
            SchedulerError::NotFound("task 7".into()).to_string(),
            "record not found: task 7"
        );
    }
}
