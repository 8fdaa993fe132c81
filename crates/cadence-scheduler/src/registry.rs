//! Lazily spawned account workers, one per account id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cadence_core::CadenceConfig;
use tracing::{info, warn};

use crate::client::ActionClient;
use crate::error::{Result, SchedulerError};
use crate::worker::{AccountHandle, AccountWorker};

/// Owns the handles of every account worker. Accounts dispatch fully in
/// parallel; each account's own state is serialized by its worker.
pub struct AccountRegistry {
    config: Arc<CadenceConfig>,
    client: Arc<dyn ActionClient>,
    workers: Mutex<HashMap<String, AccountHandle>>,
}

impl AccountRegistry {
    pub fn new(config: Arc<CadenceConfig>, client: Arc<dyn ActionClient>) -> Self {
        Self {
            config,
            client,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for `account_id`, spawning its worker on first use or after it exited.
    pub fn handle(&self, account_id: &str) -> Result<AccountHandle> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return Err(SchedulerError::Validation(
                "account id must not be empty".to_string(),
            ));
        }
        let mut workers = self.lock();
        if let Some(handle) = workers.get(account_id) {
            if handle.is_running() {
                return Ok(handle.clone());
            }
            warn!(account_id, "Account worker exited; respawning");
        }
        let handle = AccountWorker::spawn(account_id, &self.config, Arc::clone(&self.client))?;
        workers.insert(account_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Handle for an account whose worker is already running.
    pub fn get(&self, account_id: &str) -> Option<AccountHandle> {
        self.lock()
            .get(account_id)
            .filter(|handle| handle.is_running())
            .cloned()
    }

    pub fn active_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, handle)| handle.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        accounts.sort();
        accounts
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    /// Stop every worker. Used on graceful shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<AccountHandle> = self.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                warn!(account_id = handle.account_id(), error = %e, "Worker did not acknowledge shutdown");
            }
        }
        info!(workers = count, "All account workers stopped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AccountHandle>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SimulatedClient;
    use cadence_core::config::SimulatorConfig;

    fn registry() -> AccountRegistry {
        let client = SimulatedClient::new(SimulatorConfig {
            success_rate: 1.0,
            rate_limit_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
        });
        AccountRegistry::new(Arc::new(CadenceConfig::default()), Arc::new(client))
    }

    #[tokio::test]
    async fn test_same_account_shares_worker() {
        let registry = registry();
        let a = registry.handle("alice").unwrap();
        let b = registry.handle("alice").unwrap();
        a.emergency_stop(None, false).await.unwrap();
        let status = b.automation().await.unwrap();
        assert!(!status.enabled);
        assert_eq!(registry.active_accounts(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let registry = registry();
        let alice = registry.handle("alice").unwrap();
        let bob = registry.handle("bob").unwrap();
        alice.emergency_stop(None, false).await.unwrap();
        assert!(bob.automation().await.unwrap().enabled);
        assert_eq!(registry.active_accounts(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_empty_account_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.handle("  "),
            Err(SchedulerError::Validation(_))
        ));
        assert!(registry.get("nobody").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let registry = registry();
        let alice = registry.handle("alice").unwrap();
        registry.handle("bob").unwrap();
        registry.shutdown_all().await;
        assert!(registry.active_accounts().is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!alice.is_running());
    }
}
