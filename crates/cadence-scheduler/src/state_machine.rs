//! Queue item state machine with validated transitions.
//!
//! Queued -> Processing -> Completed/Failed/RateLimited
//! Failed -> Queued (retry), RateLimited -> Queued (cool-down over)
//! Any non-final state -> Cancelled

use cadence_core::types::ItemStatus;

use crate::error::SchedulerError;

/// Validate that a status transition is allowed.
pub fn validate_transition(from: ItemStatus, to: ItemStatus) -> Result<(), SchedulerError> {
    let valid = matches!(
        (from, to),
        (ItemStatus::Queued, ItemStatus::Processing)
            | (ItemStatus::Processing, ItemStatus::Completed)
            | (ItemStatus::Processing, ItemStatus::Failed)
            | (ItemStatus::Processing, ItemStatus::RateLimited)
            | (ItemStatus::Failed, ItemStatus::Queued)
            | (ItemStatus::RateLimited, ItemStatus::Queued)
            | (ItemStatus::Queued, ItemStatus::Cancelled)
            | (ItemStatus::Processing, ItemStatus::Cancelled)
            | (ItemStatus::RateLimited, ItemStatus::Cancelled)
            | (ItemStatus::Failed, ItemStatus::Cancelled)
    );

    if valid {
        Ok(())
    } else {
        Err(SchedulerError::InvalidTransition(from, to))
    }
}
