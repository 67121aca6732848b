//! Error types for the principal graph.
//!
//! All errors are strongly typed using thiserror. Callers can match on the
//! specific condition (a blocked merge, a lost race, a corrupted successor
//! chain) instead of parsing messages.

use thiserror::Error;

use crate::claim::{ClaimId, IdentityKind, Platform};
use crate::principal::PrincipalId;
use crate::review::ReviewItemId;
use crate::storage::StorageError;

fn join_ids(ids: &[ClaimId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validation errors: the request itself is unacceptable and retrying it
/// unchanged will fail the same way.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f32,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Unknown identity kind '{kind}'")]
    UnknownIdentityKind {
        kind: String,
    },

    #[error("Invalid platform '{platform}': {reason}")]
    InvalidPlatform {
        platform: String,
        reason: String,
    },

    #[error("Observation batch contains no identifiers")]
    EmptyBatch,

    #[error("Value '{value}' could not be normalized as {kind} on {platform}")]
    Unnormalized {
        platform: Platform,
        kind: IdentityKind,
        value: String,
    },

    #[error("Principal {principal_id} already holds {platform}:{normalized}")]
    DuplicateClaim {
        principal_id: PrincipalId,
        platform: Platform,
        normalized: String,
    },

    #[error("Operation requires two distinct principals, got {id} twice")]
    SamePrincipal {
        id: PrincipalId,
    },

    #[error("Principal {id} has been merged into {successor}")]
    PrincipalMerged {
        id: PrincipalId,
        successor: PrincipalId,
    },

    #[error("Claim {claim_id} is not owned by principal {principal_id}")]
    ClaimNotOwned {
        claim_id: ClaimId,
        principal_id: PrincipalId,
    },

    #[error("Claim {claim_id} is already attached to a principal")]
    ClaimAlreadyAttached {
        claim_id: ClaimId,
    },

    #[error("Merge conflict on claims [{ids}]: {reason}", ids = join_ids(.claim_ids))]
    MergeConflict {
        claim_ids: Vec<ClaimId>,
        reason: String,
    },

    #[error("Split conflict on claims [{ids}]: {reason}", ids = join_ids(.claim_ids))]
    SplitConflict {
        claim_ids: Vec<ClaimId>,
        reason: String,
    },

    #[error("Principals {a} and {b} are blocked from automatic merging")]
    MergeBlocked {
        a: PrincipalId,
        b: PrincipalId,
    },

    #[error("Invalid resolver configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while applying an operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Principal not found: {id}")]
    PrincipalNotFound {
        id: PrincipalId,
    },

    #[error("Claim not found: {id}")]
    ClaimNotFound {
        id: ClaimId,
    },

    #[error("Review item not found: {id}")]
    ReviewItemNotFound {
        id: ReviewItemId,
    },

    /// The successor chain of merged principals loops or is deeper than the
    /// configured bound. This indicates corrupted merge history.
    #[error("Successor cycle detected starting at {start} after {hops} hops")]
    CycleDetected {
        start: PrincipalId,
        hops: usize,
    },

    #[error("Timed out after {duration_ms}ms waiting for principal lock on {id}")]
    LockTimeout {
        id: PrincipalId,
        duration_ms: u64,
    },

    #[error("Gave up after {attempts} attempts due to concurrent writers")]
    Contention {
        attempts: usize,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },
}

/// Top-level error type for the principal graph.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl IdentityError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the same call may succeed when repeated later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::LockTimeout { .. } | ExecutionError::Contention { .. }
            ),
            Self::Internal { .. } => false,
        }
    }

    /// Returns true if the error indicates corrupted state that needs an operator.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Execution(ExecutionError::CycleDetected { .. }) | Self::Internal { .. }
        )
    }
}

impl From<StorageError> for IdentityError {
    fn from(err: StorageError) -> Self {
        let execution = match err {
            StorageError::PrincipalNotFound(id) => ExecutionError::PrincipalNotFound { id },
            StorageError::ClaimNotFound(id) => ExecutionError::ClaimNotFound { id },
            StorageError::ReviewItemNotFound(id) => ExecutionError::ReviewItemNotFound { id },
            other => ExecutionError::Storage {
                message: other.to_string(),
            },
        };
        Self::Execution(execution)
    }
}

/// Result type alias for principal graph operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_confidence() {
        let err = ValidationError::ConfidenceOutOfRange { value: 1.5 };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_merge_conflict_lists_claim_ids() {
        let a = ClaimId::new();
        let b = ClaimId::new();
        let err = ValidationError::MergeConflict {
            claim_ids: vec![a, b],
            reason: "kinds differ".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
        assert!(msg.contains("kinds differ"));
    }

    #[test]
    fn test_execution_error_cycle() {
        let err = ExecutionError::CycleDetected {
            start: PrincipalId::new(),
            hops: 64,
        };
        assert!(err.to_string().contains("64 hops"));
    }

    #[test]
    fn test_identity_error_from_validation() {
        let err: IdentityError = ValidationError::EmptyBatch.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_identity_error_retryable() {
        let err: IdentityError = ExecutionError::Contention { attempts: 4 }.into();
        assert!(err.is_execution());
        assert!(err.is_retryable());

        let err: IdentityError = ExecutionError::LockTimeout {
            id: PrincipalId::new(),
            duration_ms: 10,
        }
        .into();
        assert!(err.is_retryable());

        let err: IdentityError = ExecutionError::PrincipalNotFound {
            id: PrincipalId::new(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_not_found_maps_to_execution() {
        let id = ClaimId::new();
        let err: IdentityError = StorageError::ClaimNotFound(id).into();
        assert!(matches!(
            err,
            IdentityError::Execution(ExecutionError::ClaimNotFound { id: got }) if got == id
        ));

        let err: IdentityError = StorageError::BackendError("disk".to_string()).into();
        assert!(err.to_string().contains("disk"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_is_fatal() {
        let err: IdentityError = ExecutionError::CycleDetected {
            start: PrincipalId::new(),
            hops: 3,
        }
        .into();
        assert!(err.is_fatal());

        let err = IdentityError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(err.is_fatal());
        assert!(err.to_string().contains("unexpected state"));
    }
}
