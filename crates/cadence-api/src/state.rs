//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use cadence_core::CadenceConfig;
use cadence_scheduler::{AccountHandle, AccountRegistry, ActionClient};

use crate::error::ApiError;

/// Shared application state, cloned into every handler task.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration the workers were built from.
    pub config: Arc<CadenceConfig>,
    /// One serialized worker per account.
    pub registry: Arc<AccountRegistry>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: CadenceConfig, client: Arc<dyn ActionClient>) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Arc::new(AccountRegistry::new(Arc::clone(&config), client)),
            config,
            start_time: Instant::now(),
        }
    }

    /// Worker handle for `account_id`, spawning the worker on first use.
    pub fn account(&self, account_id: &str) -> Result<AccountHandle, ApiError> {
        Ok(self.registry.handle(account_id)?)
    }
}
