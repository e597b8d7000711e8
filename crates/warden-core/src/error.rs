use thiserror::Error;

use crate::state::LifecycleState;

/// Every failure the governor can surface.
///
/// The type is `Clone` so that a single wake outcome can be handed to every
/// caller coalesced onto the same in-flight transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WardenError {
    #[error("component not found: {0}")]
    NotFound(String),

    #[error("component already registered: {0}")]
    AlreadyExists(String),

    #[error("state CAS failed for {id}: expected {expected}, found {actual}")]
    ConflictCas {
        id: String,
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("registry record corrupt: {0}")]
    Corrupt(String),

    #[error("budget exhausted for {id}: requested {requested}, capacity {capacity}, allocated {allocated}")]
    BudgetExhausted {
        id: String,
        requested: u64,
        capacity: u64,
        allocated: u64,
    },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("snapshot checksum mismatch: {snapshot_id}")]
    ChecksumMismatch { snapshot_id: String },

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("wake of {id} did not finish within {deadline_ms}ms")]
    WakeTimeout { id: String, deadline_ms: u64 },

    #[error("transition of {id} exceeded {timeout_ms}ms")]
    TransitionTimeout { id: String, timeout_ms: u64 },

    #[error("cannot {action} {id} while {state}")]
    InvalidTransition {
        id: String,
        state: LifecycleState,
        action: &'static str,
    },

    #[error("component disabled: {0}")]
    ComponentDisabled(String),

    #[error("component {id} failed: {message}")]
    Plugin { id: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl WardenError {
    /// Transient failures that are worth retrying locally before surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WardenError::ConflictCas { .. } | WardenError::RateLimited(_))
    }

    /// Failures that mean a component's persisted state can no longer be
    /// trusted. These are never retried and always escalate to `Disabled`.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            WardenError::ChecksumMismatch { .. }
                | WardenError::Corrupt(_)
                | WardenError::SnapshotNotFound(_)
        )
    }

    /// HTTP status for the admin surface.
    pub fn status_code(&self) -> u16 {
        match self {
            WardenError::NotFound(_) | WardenError::SnapshotNotFound(_) => 404,
            WardenError::AlreadyExists(_)
            | WardenError::ConflictCas { .. }
            | WardenError::InvalidTransition { .. } => 409,
            WardenError::ComponentDisabled(_) => 423,
            WardenError::RateLimited(_) => 429,
            WardenError::BudgetExhausted { .. } | WardenError::CircuitOpen(_) => 503,
            WardenError::WakeTimeout { .. } | WardenError::TransitionTimeout { .. } => 504,
            WardenError::Plugin { .. } => 502,
            WardenError::Config(_) => 400,
            WardenError::Corrupt(_)
            | WardenError::ChecksumMismatch { .. }
            | WardenError::Storage(_)
            | WardenError::Serialization(_) => 500,
        }
    }

    /// Process exit code for the operator CLI. Zero is never returned.
    pub fn exit_code(&self) -> i32 {
        match self {
            WardenError::NotFound(_) => 2,
            WardenError::AlreadyExists(_) => 3,
            WardenError::ConflictCas { .. } => 4,
            WardenError::Corrupt(_) => 5,
            WardenError::BudgetExhausted { .. } => 6,
            WardenError::SnapshotNotFound(_) => 7,
            WardenError::ChecksumMismatch { .. } => 8,
            WardenError::CircuitOpen(_) => 9,
            WardenError::RateLimited(_) => 10,
            WardenError::WakeTimeout { .. } => 11,
            WardenError::TransitionTimeout { .. } => 12,
            WardenError::InvalidTransition { .. } => 13,
            WardenError::ComponentDisabled(_) => 14,
            WardenError::Plugin { .. } => 15,
            WardenError::Config(_) => 16,
            WardenError::Storage(_) | WardenError::Serialization(_) => 1,
        }
    }
}

impl From<std::io::Error> for WardenError {
    fn from(e: std::io::Error) -> Self {
        WardenError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Serialization(e.to_string())
    }
}
