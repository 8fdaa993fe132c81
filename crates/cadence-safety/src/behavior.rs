//! Behavioural signals derived from recent dispatch history.

use std::collections::VecDeque;

use cadence_core::config::WorkingHours;
use cadence_core::types::{ActionType, RiskFactor, RiskFactorKind};
use chrono::{DateTime, Duration, Timelike, Utc};

use crate::quota::AttemptOutcome;

/// Dispatches considered for pattern and timing analysis.
const PATTERN_WINDOW: usize = 10;
/// Gaps needed before delay uniformity is judged.
const MIN_GAPS: usize = 4;
/// Coefficient of variation below which delays look machine-generated.
const UNIFORMITY_CV: f64 = 0.15;
/// Share of one action type above which the sequence looks scripted.
const DOMINANT_SHARE: f64 = 0.8;
const MIN_PATTERN_SAMPLES: usize = 8;
/// Rate-limit signals within this horizon count as recent.
const RATE_LIMIT_HORIZON_MINS: i64 = 60;
const RATE_LIMITS_FOR_MAX: f64 = 3.0;

/// Rolling record of dispatch attempts for one account.
///
/// Both the error rate and the dispatch-pattern signals only look back
/// `horizon`, so they fade while dispatch is halted.
#[derive(Debug)]
pub struct BehaviorTracker {
    error_window: usize,
    horizon: Duration,
    working_hours: Option<WorkingHours>,
    outcomes: VecDeque<(DateTime<Utc>, AttemptOutcome)>,
    dispatches: VecDeque<(DateTime<Utc>, ActionType)>,
    rate_limits: VecDeque<DateTime<Utc>>,
}

impl BehaviorTracker {
    pub fn new(
        error_window: usize,
        horizon: Duration,
        working_hours: Option<WorkingHours>,
    ) -> Self {
        Self {
            error_window: error_window.max(1),
            horizon,
            working_hours,
            outcomes: VecDeque::new(),
            dispatches: VecDeque::new(),
            rate_limits: VecDeque::new(),
        }
    }

    pub fn set_working_hours(&mut self, working_hours: Option<WorkingHours>) {
        self.working_hours = working_hours;
    }

    pub fn record_dispatch(&mut self, action_type: ActionType, at: DateTime<Utc>) {
        self.dispatches.push_back((at, action_type));
        while self.dispatches.len() > PATTERN_WINDOW {
            self.dispatches.pop_front();
        }
    }

    pub fn record_outcome(&mut self, outcome: AttemptOutcome, at: DateTime<Utc>) {
        self.outcomes.push_back((at, outcome));
        while self.outcomes.len() > self.error_window {
            self.outcomes.pop_front();
        }
        if outcome == AttemptOutcome::RateLimited {
            self.rate_limits.push_back(at);
        }
    }

    /// Share of attempts within the horizon that failed or were rate limited.
    pub fn error_rate(&mut self, now: DateTime<Utc>) -> f64 {
        let cutoff = now - self.horizon;
        while self.outcomes.front().is_some_and(|(t, _)| *t < cutoff) {
            self.outcomes.pop_front();
        }
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let errors = self
            .outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, AttemptOutcome::Succeeded))
            .count();
        errors as f64 / self.outcomes.len() as f64
    }

    pub fn risk_factors(&mut self, now: DateTime<Utc>) -> Vec<RiskFactor> {
        let cutoff = now - self.horizon;
        while self.dispatches.front().is_some_and(|(t, _)| *t < cutoff) {
            self.dispatches.pop_front();
        }
        let horizon = now - Duration::minutes(RATE_LIMIT_HORIZON_MINS);
        while self.rate_limits.front().is_some_and(|t| *t < horizon) {
            self.rate_limits.pop_front();
        }

        let mut factors = Vec::new();
        factors.extend(self.delay_uniformity());
        factors.extend(self.pattern_regularity());
        if !self.rate_limits.is_empty() {
            let n = self.rate_limits.len();
            factors.push(RiskFactor {
                kind: RiskFactorKind::RateLimitSignals,
                severity: (n as f64 / RATE_LIMITS_FOR_MAX).min(1.0),
                description: format!("{} rate-limit responses in the last hour", n),
            });
        }
        factors.extend(self.off_hours_activity());
        factors
    }

    fn delay_uniformity(&self) -> Option<RiskFactor> {
        let times: Vec<_> = self.dispatches.iter().map(|(t, _)| *t).collect();
        let gaps: Vec<f64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).num_milliseconds() as f64)
            .collect();
        if gaps.len() < MIN_GAPS {
            return None;
        }
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        let cv = if mean <= 0.0 {
            0.0
        } else {
            let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
            variance.sqrt() / mean
        };
        if cv >= UNIFORMITY_CV {
            return None;
        }
        Some(RiskFactor {
            kind: RiskFactorKind::DelayUniformity,
            severity: (1.0 - cv / UNIFORMITY_CV).clamp(0.0, 1.0),
            description: format!(
                "Delays between the last {} dispatches vary by only {:.0}%",
                times.len(),
                cv * 100.0
            ),
        })
    }

    fn pattern_regularity(&self) -> Option<RiskFactor> {
        if self.dispatches.len() < MIN_PATTERN_SAMPLES {
            return None;
        }
        let total = self.dispatches.len();
        let (dominant, count) = ActionType::ALL
            .into_iter()
            .map(|at| (at, self.dispatches.iter().filter(|(_, t)| *t == at).count()))
            .max_by_key(|(_, count)| *count)?;
        let share = count as f64 / total as f64;
        if share <= DOMINANT_SHARE {
            return None;
        }
        Some(RiskFactor {
            kind: RiskFactorKind::PatternRegularity,
            // A single-type campaign is common, so this caps at half weight.
            severity: ((share - DOMINANT_SHARE) / (1.0 - DOMINANT_SHARE)).min(1.0) * 0.5,
            description: format!("{} of the last {} dispatches were {}", count, total, dominant),
        })
    }

    fn off_hours_activity(&self) -> Option<RiskFactor> {
        let hours = self.working_hours?;
        let outside = self
            .dispatches
            .iter()
            .filter(|(t, _)| !hours.contains(t.hour()))
            .count();
        if outside == 0 {
            return None;
        }
        Some(RiskFactor {
            kind: RiskFactorKind::OffHoursActivity,
            severity: outside as f64 / self.dispatches.len() as f64,
            description: format!("{} recent dispatches ran outside working hours", outside),
        })
    }
}
