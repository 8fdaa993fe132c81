//! Safety layer for cadence.
//!
//! Quota accounting against conservative ceilings, behavioural risk tracking,
//! the 0-100 safety score, and the emergency-stop state machine that gates
//! dispatch.

pub mod behavior;
pub mod emergency;
pub mod error;
pub mod quota;
pub mod scorer;

pub use behavior::BehaviorTracker;
pub use emergency::EmergencyStopController;
pub use error::{QuotaDenied, QuotaError, StopError};
pub use quota::{AttemptOutcome, QuotaLedger, Reservation};
pub use scorer::{Evaluation, SafetyInputs, SafetyScorer};
