//! Seam to the external client that performs social actions.

use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::SimulatorConfig;
use cadence_core::types::QueueItem;
use rand::Rng;

/// What the platform said about one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Success,
    /// Error without an explicit rate-limit signal; retried with backoff.
    TransientFailure(String),
    /// Platform asked us to slow down; the action type is frozen.
    RateLimited { retry_after: Option<Duration> },
    /// Platform flagged the account; a compliance stop follows.
    Restricted { reason: String },
}

/// Performs one queue item against the platform.
///
/// Implementations must not panic; every problem is reported as an outcome.
#[async_trait]
pub trait ActionClient: Send + Sync {
    async fn perform(&self, account_id: &str, item: &QueueItem) -> ActionOutcome;
}

/// In-process client with configurable latency and failure rates.
pub struct SimulatedClient {
    config: SimulatorConfig,
}

impl SimulatedClient {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ActionClient for SimulatedClient {
    async fn perform(&self, account_id: &str, item: &QueueItem) -> ActionOutcome {
        let (latency_ms, roll) = {
            let mut rng = rand::rng();
            let min = self.config.min_latency_ms;
            let max = self.config.max_latency_ms.max(min);
            (rng.random_range(min..=max), rng.random::<f64>())
        };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        let outcome = if roll < self.config.rate_limit_rate {
            ActionOutcome::RateLimited { retry_after: None }
        } else if roll < self.config.rate_limit_rate + self.config.success_rate {
            ActionOutcome::Success
        } else {
            ActionOutcome::TransientFailure("simulated upstream error".to_string())
        };
        tracing::debug!(
            account_id,
            item_id = %item.id,
            action_type = %item.action_type,
            latency_ms,
            ?outcome,
            "Simulated action performed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::{ActionType, ItemStatus, Priority};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_item() -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: Uuid::new_v4(),
            account_id: "acct".to_string(),
            action_type: ActionType::ViewProfile,
            target: "https://example.com/in/someone".to_string(),
            payload: serde_json::Value::Null,
            priority: Priority::Medium,
            status: ItemStatus::Processing,
            scheduled_at: now,
            created_at: now,
            processing_started_at: Some(now),
            completed_at: None,
            not_before: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            depends_on: Vec::new(),
            campaign_id: None,
            cancel_requested: false,
        }
    }

    fn config(success_rate: f64, rate_limit_rate: f64) -> SimulatorConfig {
        SimulatorConfig {
            success_rate,
            rate_limit_rate,
            min_latency_ms: 0,
            max_latency_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_always_succeeds() {
        let client = SimulatedClient::new(config(1.0, 0.0));
        for _ in 0..10 {
            assert_eq!(client.perform("acct", &sample_item()).await, ActionOutcome::Success);
        }
    }

    #[tokio::test]
    async fn test_always_rate_limited() {
        let client = SimulatedClient::new(config(0.0, 1.0));
        assert!(matches!(
            client.perform("acct", &sample_item()).await,
            ActionOutcome::RateLimited { retry_after: None }
        ));
    }

    #[tokio::test]
    async fn test_always_fails() {
        let client = SimulatedClient::new(config(0.0, 0.0));
        assert!(matches!(
            client.perform("acct", &sample_item()).await,
            ActionOutcome::TransientFailure(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_applied() {
        let client = SimulatedClient::new(SimulatorConfig {
            min_latency_ms: 500,
            max_latency_ms: 500,
            ..config(1.0, 0.0)
        });
        let start = tokio::time::Instant::now();
        client.perform("acct", &sample_item()).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
