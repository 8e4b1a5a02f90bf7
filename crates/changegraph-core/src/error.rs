use crate::{ChangeId, ConfigError, ConflictId, PartialResult, ReleaseStatus, ResourceKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChangeGraphError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unresolvable resource: {0}")]
    UnresolvableResource(String),

    #[error("Cyclic release: {} change(s) form a dependency cycle over {cycle:?}", .changes.len())]
    CyclicRelease {
        changes: Vec<ChangeId>,
        cycle: Vec<ResourceKey>,
    },

    #[error("Deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded {
        elapsed_ms: u64,
        partial: Box<PartialResult>,
    },

    #[error("Graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid release transition: {from} -> {to}")]
    InvalidTransition {
        from: ReleaseStatus,
        to: ReleaseStatus,
    },

    #[error("Approval blocked by {} unresolved critical conflict(s)", .conflicts.len())]
    ApprovalBlocked { conflicts: Vec<ConflictId> },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChangeGraphError {
    pub fn deadline(elapsed: std::time::Duration, partial: PartialResult) -> Self {
        ChangeGraphError::DeadlineExceeded {
            elapsed_ms: elapsed.as_millis() as u64,
            partial: Box::new(partial),
        }
    }

    /// Whether a caller may sensibly retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChangeGraphError::DeadlineExceeded { .. } | ChangeGraphError::StoreUnavailable(_)
        )
    }

    pub fn partial_result(&self) -> Option<&PartialResult> {
        match self {
            ChangeGraphError::DeadlineExceeded { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChangeGraphError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CycleReport, ResourceKey};
    use std::time::Duration;

    #[test]
    fn deadline_error_carries_partial_result() {
        let partial = PartialResult::Cycles(CycleReport {
            cycles: vec![vec![ResourceKey::from("a"), ResourceKey::from("b")]],
            partial: true,
        });
        let err = ChangeGraphError::deadline(Duration::from_millis(12), partial);
        assert!(err.is_retryable());
        assert!(err.partial_result().map(|p| p.is_partial()).unwrap_or(false));
        assert_eq!(err.to_string(), "Deadline exceeded after 12ms");
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = ChangeGraphError::Validation("empty change set".into());
        assert!(!err.is_retryable());
        assert!(err.partial_result().is_none());
    }
}
