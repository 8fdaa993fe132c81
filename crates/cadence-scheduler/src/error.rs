//! Error types for the scheduler.

use cadence_core::types::ItemStatus;
use cadence_safety::{QuotaDenied, QuotaError, StopError};
use uuid::Uuid;

/// Errors returned synchronously to the command that caused them.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(#[from] QuotaDenied),
    #[error("Queue item not found: {0}")]
    ItemNotFound(Uuid),
    #[error("Safety alert not found: {0}")]
    AlertNotFound(Uuid),
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(ItemStatus, ItemStatus),
    #[error("Unknown dependency: {0}")]
    UnknownDependency(Uuid),
    #[error("Item {item} cannot be placed ahead of its dependency {dependency}")]
    DependencyOrderViolation { item: Uuid, dependency: Uuid },
    #[error("Item {0} is {1}; only queued items can be reordered or reprioritized")]
    NotQueued(Uuid, ItemStatus),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Stop(#[from] StopError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("Account worker is not running")]
    WorkerUnavailable,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
