//! Safety score evaluation.
//!
//! Every evaluation produces a new immutable [`SafetyStatus`] that is swapped in
//! atomically. Readers load the current `Arc` and never see a half-updated
//! status; writers (the cadence tick and the post-dispatch re-evaluation) are
//! serialized by the state lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use cadence_core::config::SafetyConfig;
use cadence_core::types::{
    AlertSeverity, OverallStatus, RiskFactor, SafetyAlert, SafetyStatus, ScoreBand, Trend,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

/// Alerts retained for the history view.
const ALERT_HISTORY_LIMIT: usize = 200;
/// Score change against the recent mean that counts as a trend.
const TREND_THRESHOLD: f64 = 2.0;
/// Error rate at which the error penalty saturates.
const ERROR_RATE_SATURATION: f64 = 0.5;
/// Combined risk severity at which the risk penalty saturates.
const RISK_SATURATION: f64 = 2.0;

/// Signals feeding one evaluation.
#[derive(Debug, Clone, Default)]
pub struct SafetyInputs {
    /// Peak quota utilization across action types, 0.0 to 1.0.
    pub utilization: f64,
    /// Share of recent dispatch attempts that failed.
    pub error_rate: f64,
    pub risk_factors: Vec<RiskFactor>,
}

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub status: Arc<SafetyStatus>,
    /// Present when the band changed; already recorded in the alert history.
    pub transition: Option<SafetyAlert>,
}

struct ScorerState {
    version: u64,
    band: ScoreBand,
    suspended: bool,
    alerts: VecDeque<SafetyAlert>,
    samples: VecDeque<f64>,
    last_inputs: SafetyInputs,
}

pub struct SafetyScorer {
    config: SafetyConfig,
    current: ArcSwap<SafetyStatus>,
    state: Mutex<ScorerState>,
}

impl SafetyScorer {
    pub fn new(config: SafetyConfig) -> Self {
        let now = Utc::now();
        let next_check = now + Duration::seconds(config.health_check_interval_secs as i64);
        let initial = SafetyStatus::initial(next_check);
        Self {
            config,
            current: ArcSwap::from_pointee(initial),
            state: Mutex::new(ScorerState {
                version: 0,
                band: ScoreBand::Excellent,
                suspended: false,
                alerts: VecDeque::new(),
                samples: VecDeque::new(),
                last_inputs: SafetyInputs::default(),
            }),
        }
    }

    /// Latest published status.
    pub fn current(&self) -> Arc<SafetyStatus> {
        self.current.load_full()
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Compute and publish a new status from `inputs`.
    pub fn evaluate(&self, inputs: SafetyInputs, now: DateTime<Utc>) -> Evaluation {
        let mut state = self.lock();
        state.last_inputs = inputs;
        self.evaluate_locked(&mut state, now, true)
    }

    /// Mark an alert acknowledged so it stops deducting from the score, then
    /// republish. Returns `None` when the alert is unknown.
    pub fn acknowledge(&self, alert_id: Uuid, now: DateTime<Utc>) -> Option<Evaluation> {
        let mut state = self.lock();
        let alert = state.alerts.iter_mut().find(|a| a.id == alert_id)?;
        if !alert.acknowledged {
            alert.acknowledged = true;
            info!(alert_id = %alert_id, "Safety alert acknowledged");
        }
        Some(self.evaluate_locked(&mut state, now, false))
    }

    /// Record an operational alert that is not tied to a band change (for
    /// example an item exhausting its retries) and republish with its penalty.
    pub fn raise(
        &self,
        severity: AlertSeverity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> (SafetyAlert, Evaluation) {
        let mut state = self.lock();
        let alert = SafetyAlert {
            id: Uuid::new_v4(),
            severity,
            from_band: state.band,
            to_band: state.band,
            score: self.current().score,
            message: message.into(),
            created_at: now,
            acknowledged: false,
            auto_resolved: false,
        };
        state.alerts.push_back(alert.clone());
        while state.alerts.len() > ALERT_HISTORY_LIMIT {
            state.alerts.pop_front();
        }
        let evaluation = self.evaluate_locked(&mut state, now, false);
        (alert, evaluation)
    }

    /// Flag the published status as suspended while an emergency stop holds.
    pub fn set_suspended(&self, suspended: bool) -> Arc<SafetyStatus> {
        let mut state = self.lock();
        if state.suspended == suspended {
            return self.current();
        }
        state.suspended = suspended;
        state.version += 1;
        let mut status = (*self.current()).clone();
        status.version = state.version;
        status.overall = overall_for(status.band, suspended);
        let status = Arc::new(status);
        self.current.store(Arc::clone(&status));
        status
    }

    /// Every recorded alert, newest first.
    pub fn alert_history(&self) -> Vec<SafetyAlert> {
        self.lock().alerts.iter().rev().cloned().collect()
    }

    fn evaluate_locked(
        &self,
        state: &mut ScorerState,
        now: DateTime<Utc>,
        sample: bool,
    ) -> Evaluation {
        let score = self.score(&state.last_inputs, state.alerts.iter());
        let band = self.config.bands.band(score);

        let mut transition = None;
        if band != state.band {
            let alert = SafetyAlert {
                id: Uuid::new_v4(),
                severity: band.severity(),
                from_band: state.band,
                to_band: band,
                score,
                message: transition_message(state.band, band, score),
                created_at: now,
                acknowledged: false,
                auto_resolved: false,
            };
            match alert.severity {
                AlertSeverity::Critical => {
                    warn!(score, %band, "Safety score entered critical territory")
                }
                AlertSeverity::Warning => warn!(score, %band, "Safety score degraded"),
                AlertSeverity::Info => info!(score, %band, "Safety band changed"),
            }
            if band < state.band {
                for existing in state.alerts.iter_mut() {
                    if is_active(existing) && existing.to_band > band {
                        existing.auto_resolved = true;
                    }
                }
            }
            // Info alerts only describe the latest state; older ones lapse.
            for existing in state.alerts.iter_mut() {
                if is_active(existing) && existing.severity == AlertSeverity::Info {
                    existing.auto_resolved = true;
                }
            }
            state.alerts.push_back(alert.clone());
            while state.alerts.len() > ALERT_HISTORY_LIMIT {
                state.alerts.pop_front();
            }
            state.band = band;
            transition = Some(alert);
        }

        let trend = if sample {
            let trend = trend_against(&state.samples, score);
            state.samples.push_back(score);
            while state.samples.len() > self.config.trend_samples.max(1) {
                state.samples.pop_front();
            }
            trend
        } else {
            self.current().trend
        };

        state.version += 1;
        let status = Arc::new(SafetyStatus {
            version: state.version,
            score,
            band,
            overall: overall_for(band, state.suspended),
            active_alerts: state.alerts.iter().rev().filter(|a| is_active(a)).cloned().collect(),
            risk_factors: state.last_inputs.risk_factors.clone(),
            error_rate: state.last_inputs.error_rate,
            utilization: state.last_inputs.utilization,
            last_check: now,
            next_check: now + Duration::seconds(self.config.health_check_interval_secs as i64),
            trend,
        });
        self.current.store(Arc::clone(&status));
        Evaluation { status, transition }
    }

    /// `100 - Σ weight·penalty`, each penalty in 0..=100, rounded to one decimal.
    fn score<'a>(
        &self,
        inputs: &SafetyInputs,
        alerts: impl Iterator<Item = &'a SafetyAlert>,
    ) -> f64 {
        let weights = &self.config.weights;
        let utilization_penalty = inputs.utilization.clamp(0.0, 1.0) * 100.0;
        let error_penalty = (inputs.error_rate / ERROR_RATE_SATURATION).clamp(0.0, 1.0) * 100.0;
        let risk_total: f64 = inputs.risk_factors.iter().map(|f| f.severity.max(0.0)).sum();
        let risk_penalty = (risk_total / RISK_SATURATION).min(1.0) * 100.0;
        let alert_penalty = alerts
            .filter(|a| is_active(a))
            .map(|a| match a.severity {
                AlertSeverity::Info => 0.0,
                AlertSeverity::Warning => 10.0,
                AlertSeverity::Critical => 25.0,
            })
            .sum::<f64>()
            .min(100.0);

        let raw = 100.0
            - weights.utilization * utilization_penalty
            - weights.error_rate * error_penalty
            - weights.risk * risk_penalty
            - weights.alerts * alert_penalty;
        (raw.clamp(0.0, 100.0) * 10.0).round() / 10.0
    }

    fn lock(&self) -> MutexGuard<'_, ScorerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_active(alert: &SafetyAlert) -> bool {
    !alert.acknowledged && !alert.auto_resolved
}

fn overall_for(band: ScoreBand, suspended: bool) -> OverallStatus {
    if suspended {
        OverallStatus::Suspended
    } else {
        band.overall()
    }
}

fn trend_against(samples: &VecDeque<f64>, score: f64) -> Trend {
    if samples.is_empty() {
        return Trend::Stable;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    if score > mean + TREND_THRESHOLD {
        Trend::Improving
    } else if score < mean - TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

fn transition_message(from: ScoreBand, to: ScoreBand, score: f64) -> String {
    if to > from {
        format!("Safety score dropped to {:.1} ({} -> {})", score, from, to)
    } else {
        format!("Safety score recovered to {:.1} ({} -> {})", score, from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::RiskFactorKind;

    fn inputs(utilization: f64, error_rate: f64, risk: f64) -> SafetyInputs {
        let risk_factors = if risk > 0.0 {
            vec![RiskFactor {
                kind: RiskFactorKind::DelayUniformity,
                severity: risk,
                description: "test".to_string(),
            }]
        } else {
            Vec::new()
        };
        SafetyInputs {
            utilization,
            error_rate,
            risk_factors,
        }
    }

    #[test]
    fn test_clean_inputs_score_full() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        let eval = scorer.evaluate(SafetyInputs::default(), Utc::now());
        assert_eq!(eval.status.score, 100.0);
        assert_eq!(eval.status.band, ScoreBand::Excellent);
        assert!(eval.transition.is_none());
        assert_eq!(eval.status.version, 1);
    }

    #[test]
    fn test_drop_from_72_to_28_emits_critical_alert() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        let now = Utc::now();

        // Error penalty 80 at weight 0.35.
        let first = scorer.evaluate(inputs(0.0, 0.4, 0.0), now);
        assert!((first.status.score - 72.0).abs() < 0.05);
        assert_eq!(first.status.band, ScoreBand::Fair);
        assert_eq!(first.transition.unwrap().severity, AlertSeverity::Info);

        // Full utilization and error penalties plus a 48 risk penalty.
        let second = scorer.evaluate(inputs(1.0, 1.0, 0.96), now + Duration::seconds(30));
        assert!((second.status.score - 28.0).abs() < 0.05);
        assert_eq!(second.status.band, ScoreBand::Emergency);
        assert_eq!(second.status.overall, OverallStatus::Critical);
        assert_eq!(second.status.trend, Trend::Declining);
        let alert = second.transition.unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.from_band, ScoreBand::Fair);
        assert_eq!(second.status.active_alerts.len(), 1);
        assert_eq!(second.status.active_alerts[0].id, alert.id);
    }

    #[test]
    fn test_published_status_is_immutable_snapshot() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        let before = scorer.current();
        scorer.evaluate(inputs(0.5, 0.0, 0.0), Utc::now());
        let after = scorer.current();
        assert_eq!(before.version, 0);
        assert_eq!(before.score, 100.0);
        assert_eq!(after.version, 1);
        assert!((after.score - 87.5).abs() < 1e-9);
    }

    #[test]
    fn test_acknowledged_alert_stops_deducting() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        let now = Utc::now();
        let eval = scorer.evaluate(inputs(1.0, 0.5, 0.0), now);
        // 100 - 25 - 35 = 40: critical band.
        assert_eq!(eval.status.band, ScoreBand::Critical);
        let alert = eval.transition.unwrap();

        // The unacknowledged critical alert costs another 3.75 points.
        let penalized = scorer.evaluate(inputs(1.0, 0.5, 0.0), now);
        assert!(penalized.status.score > 36.0 && penalized.status.score < 36.5);

        let acked = scorer.acknowledge(alert.id, now).unwrap();
        assert!((acked.status.score - 40.0).abs() < 0.05);
        assert!(acked.status.active_alerts.is_empty());
        let history = scorer.alert_history();
        assert!(history.iter().any(|a| a.id == alert.id && a.acknowledged));
    }

    #[test]
    fn test_raised_alert_is_active_until_acknowledged() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        let now = Utc::now();
        let (alert, eval) = scorer.raise(AlertSeverity::Warning, "item failed", now);
        assert_eq!(alert.from_band, alert.to_band);
        assert!((eval.status.score - 98.5).abs() < 0.05);
        assert_eq!(eval.status.active_alerts.len(), 1);

        let acked = scorer.acknowledge(alert.id, now).unwrap();
        assert_eq!(acked.status.score, 100.0);
    }

    #[test]
    fn test_acknowledge_unknown_alert() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        assert!(scorer.acknowledge(Uuid::new_v4(), Utc::now()).is_none());
    }

    #[test]
    fn test_recovery_auto_resolves_worse_alerts() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        let now = Utc::now();
        let bad = scorer.evaluate(inputs(1.0, 0.5, 0.0), now).transition.unwrap();
        let good = scorer.evaluate(SafetyInputs::default(), now);
        assert_eq!(good.status.band, ScoreBand::Excellent);
        assert!(good.status.active_alerts.iter().all(|a| a.id != bad.id));
        let history = scorer.alert_history();
        assert!(history.iter().any(|a| a.id == bad.id && a.auto_resolved));
    }

    #[test]
    fn test_suspended_overrides_overall() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        scorer.evaluate(SafetyInputs::default(), Utc::now());
        let status = scorer.set_suspended(true);
        assert_eq!(status.overall, OverallStatus::Suspended);
        assert_eq!(status.version, 2);
        let status = scorer.evaluate(SafetyInputs::default(), Utc::now()).status;
        assert_eq!(status.overall, OverallStatus::Suspended);
        assert_eq!(scorer.set_suspended(false).overall, OverallStatus::Healthy);
    }

    #[test]
    fn test_trend_detection() {
        let scorer = SafetyScorer::new(SafetyConfig::default());
        let now = Utc::now();
        scorer.evaluate(inputs(0.8, 0.0, 0.0), now);
        let improving = scorer.evaluate(SafetyInputs::default(), now).status;
        assert_eq!(improving.trend, Trend::Improving);
    }

    #[test]
    fn test_weights_are_configurable() {
        let mut config = SafetyConfig::default();
        config.weights.utilization = 0.0;
        let scorer = SafetyScorer::new(config);
        let status = scorer.evaluate(inputs(1.0, 0.0, 0.0), Utc::now()).status;
        assert_eq!(status.score, 100.0);
    }
}
