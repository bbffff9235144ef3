//! Application state

use std::sync::Arc;

use billsync_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        let billing = billing.with_sync_timeout(config.sync_timeout);
        Self {
            config,
            billing: Arc::new(billing),
        }
    }
}
