//! Emergency-stop state machine.
//!
//! Running -> Stopping -> Stopped -> (Eligible | AwaitingManualClearance) -> Running
//!
//! Owned by the per-account worker; every method takes the current time so the
//! transitions can be driven deterministically.

use cadence_core::config::SafetyConfig;
use cadence_core::types::{
    AutomationStatus, EmergencyStopRecord, SafetyStatus, ScoreBand, StopCause, StopPhase,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StopError;

#[derive(Debug)]
pub struct EmergencyStopController {
    phase: StopPhase,
    record: Option<EmergencyStopRecord>,
    recovering_since: Option<DateTime<Utc>>,
    recovery_floor: f64,
    recovery_window: Duration,
    drain_timeout: Duration,
    auto_resume: bool,
}

impl EmergencyStopController {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            phase: StopPhase::Running,
            record: None,
            recovering_since: None,
            // Recovery means leaving the warning band, i.e. reaching fair or better.
            recovery_floor: config.bands.fair,
            recovery_window: Duration::seconds(config.recovery_window_secs as i64),
            drain_timeout: Duration::seconds(config.stop_drain_timeout_secs as i64),
            auto_resume: config.auto_resume,
        }
    }

    pub fn phase(&self) -> StopPhase {
        self.phase
    }

    pub fn record(&self) -> Option<&EmergencyStopRecord> {
        self.record.as_ref()
    }

    /// Whether the dispatch loop may start a new item.
    pub fn may_dispatch(&self) -> bool {
        self.phase == StopPhase::Running
    }

    pub fn status(&self, in_flight: Option<Uuid>) -> AutomationStatus {
        AutomationStatus {
            phase: self.phase,
            enabled: self.phase == StopPhase::Running,
            suspended: self.phase != StopPhase::Running,
            stop: self.record.clone(),
            in_flight,
        }
    }

    /// Halt dispatch. Returns whether anything changed.
    ///
    /// A compliance trigger escalates any existing stop to require manual
    /// clearance; other triggers on an already-halted controller are no-ops.
    pub fn trigger(
        &mut self,
        cause: StopCause,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        in_flight: bool,
    ) -> bool {
        let reason = reason.into();
        if self.phase != StopPhase::Running {
            return self.escalate(cause, reason);
        }

        warn!(%cause, reason = %reason, "Emergency stop triggered");
        self.recovering_since = None;
        self.record = Some(EmergencyStopRecord {
            active: true,
            cause,
            reason,
            requires_manual_clearance: cause == StopCause::ComplianceViolation,
            triggered_at: now,
            stopped_at: None,
            estimated_resume_at: None,
        });
        self.phase = StopPhase::Stopping;
        if !in_flight {
            self.complete_stop(now);
        }
        true
    }

    /// The in-flight dispatch finished; complete a pending stop.
    pub fn on_drained(&mut self, now: DateTime<Utc>) -> bool {
        if self.phase != StopPhase::Stopping {
            return false;
        }
        self.complete_stop(now);
        true
    }

    /// Periodic check: force `Stopped` when draining exceeds its bound.
    pub fn tick(&mut self, now: DateTime<Utc>, in_flight: bool) -> bool {
        if self.phase != StopPhase::Stopping {
            return false;
        }
        let triggered_at = self.record.as_ref().map(|r| r.triggered_at).unwrap_or(now);
        if in_flight && now - triggered_at < self.drain_timeout {
            return false;
        }
        if in_flight {
            warn!("In-flight dispatch did not drain in time; forcing stop");
        }
        self.complete_stop(now);
        true
    }

    /// Feed a freshly published score. Returns whether the phase changed.
    pub fn observe_score(
        &mut self,
        status: &SafetyStatus,
        now: DateTime<Utc>,
        in_flight: bool,
    ) -> bool {
        let critical = status.band >= ScoreBand::Critical;
        match self.phase {
            StopPhase::Running if critical => self.trigger(
                StopCause::ScoreCritical,
                format!(
                    "Safety score {:.1} fell into the {} band",
                    status.score, status.band
                ),
                now,
                in_flight,
            ),
            StopPhase::Stopped if self.cause() == Some(StopCause::ScoreCritical) => {
                self.track_recovery(status.score, now)
            }
            StopPhase::Eligible if critical && self.cause() == Some(StopCause::ScoreCritical) => {
                warn!(score = status.score, "Score relapsed before resume; stop re-armed");
                self.phase = StopPhase::Stopped;
                self.recovering_since = None;
                if let Some(record) = self.record.as_mut() {
                    record.estimated_resume_at = Some(now + self.recovery_window);
                }
                true
            }
            _ => false,
        }
    }

    /// Operator resume. `Ok(false)` when already running.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<bool, StopError> {
        match self.phase {
            StopPhase::Running => Ok(false),
            StopPhase::Eligible => {
                info!(at = %now, "Automation resumed");
                self.rearm();
                Ok(true)
            }
            StopPhase::AwaitingManualClearance => Err(StopError::ManualClearanceRequired),
            StopPhase::Stopping => Err(StopError::StopInProgress),
            StopPhase::Stopped => Err(StopError::NotYetEligible {
                estimated_resume_at: self.record.as_ref().and_then(|r| r.estimated_resume_at),
            }),
        }
    }

    /// Administrative clearance; lifts any completed stop.
    pub fn admin_resume(&mut self, operator: &str) -> Result<bool, StopError> {
        match self.phase {
            StopPhase::Running => Ok(false),
            StopPhase::Stopping => Err(StopError::StopInProgress),
            _ => {
                info!(operator, cause = ?self.cause(), "Emergency stop cleared by administrator");
                self.rearm();
                Ok(true)
            }
        }
    }

    fn cause(&self) -> Option<StopCause> {
        self.record.as_ref().map(|r| r.cause)
    }

    fn escalate(&mut self, cause: StopCause, reason: String) -> bool {
        let Some(record) = self.record.as_mut() else {
            return false;
        };
        if cause != StopCause::ComplianceViolation || record.cause == StopCause::ComplianceViolation {
            return false;
        }
        warn!(reason = %reason, "Stop escalated to compliance violation");
        record.cause = cause;
        record.reason = reason;
        record.requires_manual_clearance = true;
        record.estimated_resume_at = None;
        if matches!(self.phase, StopPhase::Stopped | StopPhase::Eligible) {
            self.phase = StopPhase::AwaitingManualClearance;
        }
        true
    }

    fn complete_stop(&mut self, now: DateTime<Utc>) {
        let Some(record) = self.record.as_mut() else {
            self.phase = StopPhase::Running;
            return;
        };
        record.stopped_at = Some(now);
        self.phase = match record.cause {
            StopCause::Manual => {
                record.estimated_resume_at = Some(now);
                StopPhase::Eligible
            }
            StopCause::ComplianceViolation => StopPhase::AwaitingManualClearance,
            StopCause::ScoreCritical => {
                record.estimated_resume_at = Some(now + self.recovery_window);
                StopPhase::Stopped
            }
        };
        info!(phase = %self.phase, cause = %record.cause, "Dispatch halted");
    }

    fn track_recovery(&mut self, score: f64, now: DateTime<Utc>) -> bool {
        if score < self.recovery_floor {
            self.recovering_since = None;
            if let Some(record) = self.record.as_mut() {
                record.estimated_resume_at = Some(now + self.recovery_window);
            }
            return false;
        }
        let since = *self.recovering_since.get_or_insert(now);
        let eligible_at = since + self.recovery_window;
        if let Some(record) = self.record.as_mut() {
            record.estimated_resume_at = Some(eligible_at);
        }
        if now < eligible_at {
            return false;
        }
        info!(score, "Score recovered for the full window; resume eligible");
        self.phase = StopPhase::Eligible;
        if self.auto_resume {
            info!("Auto-resume enabled; re-arming dispatch");
            self.rearm();
        }
        true
    }

    fn rearm(&mut self) {
        self.phase = StopPhase::Running;
        self.record = None;
        self.recovering_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(score: f64, band: ScoreBand) -> SafetyStatus {
        let mut status = SafetyStatus::initial(Utc::now());
        status.score = score;
        status.band = band;
        status.overall = band.overall();
        status
    }

    fn controller() -> EmergencyStopController {
        EmergencyStopController::new(&SafetyConfig::default())
    }

    #[test]
    fn test_resume_when_running_is_noop() {
        let mut ctl = controller();
        assert_eq!(ctl.resume(Utc::now()), Ok(false));
        assert_eq!(ctl.resume(Utc::now()), Ok(false));
        assert!(ctl.may_dispatch());
    }

    #[test]
    fn test_manual_stop_waits_for_drain() {
        let mut ctl = controller();
        let now = Utc::now();
        assert!(ctl.trigger(StopCause::Manual, "operator", now, true));
        assert_eq!(ctl.phase(), StopPhase::Stopping);
        assert!(!ctl.may_dispatch());
        assert_eq!(ctl.resume(now), Err(StopError::StopInProgress));

        assert!(ctl.on_drained(now + Duration::seconds(2)));
        assert_eq!(ctl.phase(), StopPhase::Eligible);
        let record = ctl.record().unwrap();
        assert_eq!(record.reason, "operator");
        assert!(record.stopped_at.is_some());

        assert_eq!(ctl.resume(now), Ok(true));
        assert_eq!(ctl.phase(), StopPhase::Running);
        assert!(ctl.record().is_none());
    }

    #[test]
    fn test_drain_timeout_forces_stopped() {
        let mut ctl = controller();
        let now = Utc::now();
        ctl.trigger(StopCause::ScoreCritical, "low score", now, true);
        assert!(!ctl.tick(now + Duration::seconds(10), true));
        assert!(ctl.tick(now + Duration::seconds(31), true));
        assert_eq!(ctl.phase(), StopPhase::Stopped);
    }

    #[test]
    fn test_critical_score_stops_immediately_when_idle() {
        let mut ctl = controller();
        let now = Utc::now();
        assert!(!ctl.observe_score(&status(72.0, ScoreBand::Fair), now, false));
        assert!(ctl.observe_score(&status(28.0, ScoreBand::Emergency), now, false));
        assert_eq!(ctl.phase(), StopPhase::Stopped);
        let record = ctl.record().unwrap();
        assert_eq!(record.cause, StopCause::ScoreCritical);
        assert!(!record.requires_manual_clearance);
        assert_eq!(record.estimated_resume_at, Some(now + Duration::minutes(10)));
        assert!(matches!(
            ctl.resume(now),
            Err(StopError::NotYetEligible {
                estimated_resume_at: Some(_)
            })
        ));
    }

    #[test]
    fn test_warning_band_is_advisory() {
        let mut ctl = controller();
        assert!(!ctl.observe_score(&status(50.0, ScoreBand::Warning), Utc::now(), false));
        assert!(ctl.may_dispatch());
    }

    #[test]
    fn test_sustained_recovery_required() {
        let mut ctl = controller();
        let t0 = Utc::now();
        ctl.observe_score(&status(35.0, ScoreBand::Critical), t0, false);

        // A single good tick is not enough.
        assert!(!ctl.observe_score(&status(80.0, ScoreBand::Good), t0 + Duration::minutes(1), false));
        // Dipping back below the floor restarts the window.
        ctl.observe_score(&status(50.0, ScoreBand::Warning), t0 + Duration::minutes(5), false);
        ctl.observe_score(&status(80.0, ScoreBand::Good), t0 + Duration::minutes(6), false);
        assert!(!ctl.observe_score(&status(80.0, ScoreBand::Good), t0 + Duration::minutes(15), false));
        assert_eq!(ctl.phase(), StopPhase::Stopped);

        assert!(ctl.observe_score(&status(82.0, ScoreBand::Good), t0 + Duration::minutes(16), false));
        assert_eq!(ctl.phase(), StopPhase::Eligible);
        assert_eq!(ctl.resume(t0 + Duration::minutes(17)), Ok(true));
    }

    #[test]
    fn test_auto_resume_rearms() {
        let mut config = SafetyConfig::default();
        config.auto_resume = true;
        config.recovery_window_secs = 0;
        let mut ctl = EmergencyStopController::new(&config);
        let now = Utc::now();
        ctl.observe_score(&status(20.0, ScoreBand::Emergency), now, false);
        assert!(ctl.observe_score(&status(95.0, ScoreBand::Excellent), now, false));
        assert_eq!(ctl.phase(), StopPhase::Running);
    }

    #[test]
    fn test_compliance_stop_requires_admin_clearance() {
        let mut ctl = controller();
        let now = Utc::now();
        ctl.trigger(StopCause::ComplianceViolation, "account restricted", now, false);
        assert_eq!(ctl.phase(), StopPhase::AwaitingManualClearance);
        assert_eq!(ctl.resume(now), Err(StopError::ManualClearanceRequired));
        // Recovery does not clear a compliance stop.
        assert!(!ctl.observe_score(&status(99.0, ScoreBand::Excellent), now, false));

        assert_eq!(ctl.admin_resume("ops@example.com"), Ok(true));
        assert!(ctl.may_dispatch());
    }

    #[test]
    fn test_compliance_escalates_existing_stop() {
        let mut ctl = controller();
        let now = Utc::now();
        ctl.trigger(StopCause::Manual, "pause", now, false);
        assert_eq!(ctl.phase(), StopPhase::Eligible);
        assert!(!ctl.trigger(StopCause::Manual, "again", now, false));
        assert!(ctl.trigger(StopCause::ComplianceViolation, "restricted", now, false));
        assert_eq!(ctl.phase(), StopPhase::AwaitingManualClearance);
        assert!(ctl.record().unwrap().requires_manual_clearance);
    }

    #[test]
    fn test_status_reflects_phase() {
        let mut ctl = controller();
        let running = ctl.status(None);
        assert!(running.enabled);
        assert!(!running.suspended);
        ctl.trigger(StopCause::Manual, "x", Utc::now(), false);
        let stopped = ctl.status(None);
        assert!(stopped.suspended);
        assert_eq!(stopped.stop.unwrap().cause, StopCause::Manual);
    }
}
