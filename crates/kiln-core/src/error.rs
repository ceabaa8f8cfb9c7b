//! Platform-wide error taxonomy.
//!
//! Every layer speaks `ApiError`; handlers map it to HTTP once, the placer
//! consults `is_retryable` to decide whether to try another runner, and the
//! agent surfaces container/slot errors unchanged.

use thiserror::Error;

/// Result alias used across the kiln crates.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors that can flow from any kiln subsystem to a caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// Malformed request or invalid resource.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The named resource does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Unique-key violation on create.
    #[error("{0} already exists")]
    Conflict(&'static str),

    /// The node is at capacity; a placer may retry elsewhere.
    #[error("resource temporarily unavailable")]
    ResourceUnavailable,

    /// Waited beyond the deadline for a container slot.
    #[error("timed out waiting for a container slot")]
    SlotTimeout,

    /// The invocation deadline elapsed before any runner accepted.
    #[error("placement deadline exceeded")]
    PlacementTimeout,

    /// The invocation deadline elapsed while the function was executing.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The container failed to start or crashed mid-call.
    #[error("container error: {0}")]
    ContainerError(String),

    /// The container exited non-zero.
    #[error("function exited with status {exit}")]
    FunctionError { exit: i32 },

    /// A data-access upstream (API node, store) failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The node is shutting down and refuses new work.
    #[error("node is draining")]
    NodeDraining,

    /// The operation is not supported on this node role.
    #[error("operation not supported on this node")]
    NotSupported,

    /// Invariant violation or unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Whether a placer should move on to another runner after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::ResourceUnavailable | ApiError::SlotTimeout)
    }

    /// Stable machine-readable name, used in call records and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::NotFound(_) => "not-found",
            ApiError::Conflict(_) => "conflict",
            ApiError::ResourceUnavailable => "resource-unavailable",
            ApiError::SlotTimeout => "slot-timeout",
            ApiError::PlacementTimeout => "placement-deadline-exceeded",
            ApiError::DeadlineExceeded => "deadline-exceeded",
            ApiError::ContainerError(_) => "container-error",
            ApiError::FunctionError { .. } => "function-error",
            ApiError::Upstream(_) => "upstream",
            ApiError::NodeDraining => "node-draining",
            ApiError::NotSupported => "not-supported",
            ApiError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_is_exactly_capacity_and_slot_timeout() {
        assert!(ApiError::ResourceUnavailable.is_retryable());
        assert!(ApiError::SlotTimeout.is_retryable());

        assert!(!ApiError::PlacementTimeout.is_retryable());
        assert!(!ApiError::ContainerError("x".into()).is_retryable());
        assert!(!ApiError::FunctionError { exit: 1 }.is_retryable());
        assert!(!ApiError::NotFound("app").is_retryable());
        assert!(!ApiError::NodeDraining.is_retryable());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ApiError::SlotTimeout.kind(), "slot-timeout");
        assert_eq!(
            ApiError::PlacementTimeout.kind(),
            "placement-deadline-exceeded"
        );
        assert_eq!(ApiError::FunctionError { exit: 2 }.kind(), "function-error");
    }
}
