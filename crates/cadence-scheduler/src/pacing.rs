//! Human-like pacing between dispatches.
//!
//! Each action type has its own next-allowed time, pushed out by a random
//! delay after every dispatch, and an independent freeze set when the platform
//! reports a rate limit.

use std::collections::HashMap;

use cadence_core::config::{ActionDelays, RetryConfig};
use cadence_core::types::ActionType;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

#[derive(Debug)]
pub struct Pacer {
    delays: ActionDelays,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
    next_allowed: HashMap<ActionType, DateTime<Utc>>,
    frozen_until: HashMap<ActionType, DateTime<Utc>>,
}

impl Pacer {
    pub fn new(delays: ActionDelays, retry: &RetryConfig) -> Self {
        Self {
            delays,
            base_backoff_ms: retry.base_backoff_ms,
            max_backoff_ms: retry.max_backoff_ms,
            next_allowed: HashMap::new(),
            frozen_until: HashMap::new(),
        }
    }

    pub fn delays(&self) -> ActionDelays {
        self.delays
    }

    pub fn set_delays(&mut self, delays: ActionDelays) {
        self.delays = delays;
    }

    /// Whether `action_type` may dispatch at `now`: past both its pacing
    /// delay and any rate-limit freeze.
    pub fn is_ready(&self, action_type: ActionType, now: DateTime<Utc>) -> bool {
        let paced = self.next_allowed.get(&action_type).map_or(true, |t| *t <= now);
        paced && !self.is_frozen(action_type, now)
    }

    pub fn is_frozen(&self, action_type: ActionType, now: DateTime<Utc>) -> bool {
        self.frozen_until.get(&action_type).is_some_and(|t| *t > now)
    }

    pub fn frozen_until(&self, action_type: ActionType) -> Option<DateTime<Utc>> {
        self.frozen_until.get(&action_type).copied()
    }

    /// Record a dispatch and draw the delay before the next one of this type.
    pub fn record_dispatch(&mut self, action_type: ActionType, now: DateTime<Utc>) -> DateTime<Utc> {
        let range = self.delays.get(action_type);
        let delay_ms = rand::rng().random_range(range.min_ms..=range.max_ms);
        let next = now + Duration::milliseconds(delay_ms as i64);
        self.next_allowed.insert(action_type, next);
        next
    }

    /// Freeze an action type until `until`. An earlier freeze never shortens a later one.
    pub fn freeze(&mut self, action_type: ActionType, until: DateTime<Utc>) {
        let entry = self.frozen_until.entry(action_type).or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Exponential backoff before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::milliseconds(ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::config::DelayRange;

    fn pacer() -> Pacer {
        Pacer::new(ActionDelays::default(), &RetryConfig::default())
    }

    #[test]
    fn test_delay_drawn_from_configured_range() {
        let mut pacer = pacer();
        let now = Utc::now();
        for _ in 0..50 {
            let next = pacer.record_dispatch(ActionType::Connection, now);
            let delay = (next - now).num_milliseconds();
            assert!((45_000..=180_000).contains(&delay), "delay {delay} out of range");
        }
        assert!(!pacer.is_ready(ActionType::Connection, now));
        assert!(pacer.is_ready(ActionType::Like, now));
        assert!(pacer.is_ready(ActionType::Connection, now + Duration::minutes(3)));
    }

    #[test]
    fn test_delays_are_not_constant() {
        let mut pacer = pacer();
        let now = Utc::now();
        let draws: std::collections::HashSet<_> = (0..20)
            .map(|_| pacer.record_dispatch(ActionType::Like, now))
            .collect();
        assert!(draws.len() > 1);
    }

    #[test]
    fn test_freeze_independent_of_pacing() {
        let mut pacer = Pacer::new(
            ActionDelays::uniform(DelayRange::new(0, 0)),
            &RetryConfig::default(),
        );
        let now = Utc::now();
        pacer.record_dispatch(ActionType::Like, now);
        assert!(pacer.is_ready(ActionType::Like, now));

        pacer.freeze(ActionType::Like, now + Duration::minutes(15));
        pacer.freeze(ActionType::Like, now + Duration::minutes(1));
        assert!(!pacer.is_ready(ActionType::Like, now + Duration::minutes(10)));
        assert!(pacer.is_ready(ActionType::Follow, now));
        assert!(pacer.is_ready(ActionType::Like, now + Duration::minutes(15)));
        assert_eq!(
            pacer.frozen_until(ActionType::Like),
            Some(now + Duration::minutes(15))
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let pacer = pacer();
        assert_eq!(pacer.backoff(1), Duration::seconds(30));
        assert_eq!(pacer.backoff(2), Duration::seconds(60));
        assert_eq!(pacer.backoff(3), Duration::seconds(120));
        assert_eq!(pacer.backoff(10), Duration::minutes(15));
        assert_eq!(pacer.backoff(u32::MAX), Duration::minutes(15));
    }
}
