//! On-demand resynchronisation
//!
//! Called before rendering billing state. Never fails the caller: provider
//! trouble degrades to the last stored snapshot with an error message.

use std::sync::Arc;
use std::time::Duration;

use billsync_shared::CanonicalSnapshot;
use serde::Serialize;

use crate::error::BillingResult;
use crate::reconcile::SubscriptionReconciler;
use crate::store::ProfileStore;

/// Default upper bound on a forced sync
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub subscription: Option<CanonicalSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn synced(subscription: Option<CanonicalSnapshot>) -> Self {
        Self {
            success: true,
            subscription,
            error: None,
        }
    }

    fn degraded(cached: Option<CanonicalSnapshot>, error: String) -> Self {
        Self {
            success: false,
            subscription: cached,
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct SyncTrigger {
    profiles: Arc<dyn ProfileStore>,
    reconciler: SubscriptionReconciler,
    timeout: Duration,
}

impl SyncTrigger {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        reconciler: SubscriptionReconciler,
        timeout: Duration,
    ) -> Self {
        Self {
            profiles,
            reconciler,
            timeout,
        }
    }

    /// Reconcile the user now, falling back to the stored snapshot
    pub async fn force_sync(&self, user_id: &str) -> SyncResult {
        let profile = match tokio::time::timeout(self.timeout, self.profiles.get_profile(user_id))
            .await
        {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Sync could not load profile");
                return SyncResult::degraded(None, e.to_string());
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Sync timed out loading profile");
                return SyncResult::degraded(None, "sync timed out".to_string());
            }
        };

        let Some(profile) = profile else {
            tracing::debug!(user_id = %user_id, "No billing profile, nothing to sync");
            return SyncResult::synced(None);
        };

        let Some(customer_ref) = profile.customer_ref.as_deref() else {
            return SyncResult::synced(Some(profile.snapshot));
        };

        let reconcile = self.reconciler.reconcile_customer(user_id, customer_ref);
        match tokio::time::timeout(self.timeout, reconcile).await {
            Ok(Ok(snapshot)) => SyncResult::synced(Some(snapshot)),
            Ok(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    customer_ref = %customer_ref,
                    error = %e,
                    "Sync failed, using cached data"
                );
                SyncResult::degraded(Some(profile.snapshot), e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    customer_ref = %customer_ref,
                    timeout_secs = self.timeout.as_secs(),
                    "Sync timed out, using cached data"
                );
                SyncResult::degraded(Some(profile.snapshot), "sync timed out".to_string())
            }
        }
    }

    /// Stored snapshot without touching the provider
    pub async fn cached(&self, user_id: &str) -> BillingResult<Option<CanonicalSnapshot>> {
        Ok(self
            .profiles
            .get_profile(user_id)
            .await?
            .map(|profile| profile.snapshot))
    }
}
