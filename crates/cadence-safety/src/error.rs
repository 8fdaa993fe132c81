//! Error types for the safety layer.

use cadence_core::error::CadenceError;
use cadence_core::types::{ActionType, QuotaWindow};
use chrono::{DateTime, Utc};

/// A reservation refused because the window has no headroom left.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{action_type} {window} quota exhausted ({used} used, {reserved} reserved, ceiling {ceiling})"
)]
pub struct QuotaDenied {
    pub action_type: ActionType,
    pub window: QuotaWindow,
    pub used: u32,
    pub reserved: u32,
    pub ceiling: u32,
}

/// Errors from quota configuration.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error(transparent)]
    Denied(#[from] QuotaDenied),
    #[error("Invalid quota limits: {0}")]
    InvalidLimits(#[from] CadenceError),
}

/// Errors from the emergency-stop state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopError {
    #[error("Stop was caused by a compliance violation and requires administrative clearance")]
    ManualClearanceRequired,
    #[error("Automation is not yet eligible to resume")]
    NotYetEligible {
        estimated_resume_at: Option<DateTime<Utc>>,
    },
    #[error("Stop in progress; wait for in-flight work to drain")]
    StopInProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_denied_display() {
        let err = QuotaDenied {
            action_type: ActionType::Connection,
            window: QuotaWindow::Daily,
            used: 14,
            reserved: 1,
            ceiling: 15,
        };
        assert_eq!(
            err.to_string(),
            "connection daily quota exhausted (14 used, 1 reserved, ceiling 15)"
        );
    }

    #[test]
    fn test_quota_error_from_config_error() {
        let err: QuotaError = CadenceError::Config("bad".to_string()).into();
        assert!(matches!(err, QuotaError::InvalidLimits(_)));
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_stop_error_display() {
        assert!(StopError::ManualClearanceRequired
            .to_string()
            .contains("administrative clearance"));
        let err = StopError::NotYetEligible {
            estimated_resume_at: None,
        };
        assert_eq!(err.to_string(), "Automation is not yet eligible to resume");
    }
}
