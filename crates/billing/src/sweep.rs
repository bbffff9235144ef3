//! Periodic reconciliation sweep
//!
//! Webhook side effects that fail after the ledger claim are never retried by
//! the provider. The sweep re-derives every linked user's snapshot so such
//! drift is bounded by the sweep interval.

use std::sync::Arc;

use serde::Serialize;

use crate::error::BillingResult;
use crate::reconcile::SubscriptionReconciler;
use crate::store::ProfileStore;

pub const DEFAULT_SWEEP_BATCH_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Linked profiles visited
    pub scanned: usize,
    pub reconciled: usize,
    /// Reconciled profiles whose stored snapshot differed
    pub changed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ReconciliationSweep {
    profiles: Arc<dyn ProfileStore>,
    reconciler: SubscriptionReconciler,
    batch_size: i64,
}

impl ReconciliationSweep {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        reconciler: SubscriptionReconciler,
        batch_size: i64,
    ) -> Self {
        Self {
            profiles,
            reconciler,
            batch_size: batch_size.max(1),
        }
    }

    /// Reconcile every linked profile. Per-user failures are counted, not returned.
    pub async fn run(&self) -> BillingResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .profiles
                .list_linked_profiles(cursor.as_deref(), self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.user_id.clone());
            let page_len = page.len();

            for profile in page {
                let Some(customer_ref) = profile.customer_ref.as_deref() else {
                    continue;
                };
                report.scanned += 1;

                match self
                    .reconciler
                    .reconcile_customer(&profile.user_id, customer_ref)
                    .await
                {
                    Ok(snapshot) => {
                        report.reconciled += 1;
                        if snapshot != profile.snapshot {
                            report.changed += 1;
                            tracing::warn!(
                                user_id = %profile.user_id,
                                customer_ref = %customer_ref,
                                stored_tier = %profile.snapshot.tier,
                                tier = %snapshot.tier,
                                stored_status = %profile.snapshot.status,
                                status = %snapshot.status,
                                "Sweep corrected subscription drift"
                            );
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(
                            user_id = %profile.user_id,
                            customer_ref = %customer_ref,
                            error = %e,
                            "Sweep failed to reconcile user"
                        );
                    }
                }
            }

            if (page_len as i64) < self.batch_size {
                break;
            }
        }

        tracing::info!(
            scanned = report.scanned,
            reconciled = report.reconciled,
            changed = report.changed,
            failed = report.failed,
            "Reconciliation sweep finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PriceTiers;
    use crate::memory::{empty_profile, InMemoryBillingStore, InMemoryProvider};
    use crate::provider::ProviderSubscription;
    use billsync_shared::{SubscriptionStatus, Tier};

    fn active(customer_ref: &str, price: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: format!("sub_{}", customer_ref),
            customer_ref: customer_ref.to_string(),
            status: SubscriptionStatus::Active,
            price_ref: Some(price.to_string()),
            current_period_end: None,
            created: 1,
        }
    }

    fn setup(batch_size: i64) -> (
        Arc<InMemoryBillingStore>,
        Arc<InMemoryProvider>,
        ReconciliationSweep,
    ) {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(InMemoryProvider::new());
        let tiers = PriceTiers::new().with_price("price_pro", Tier::Pro);
        let reconciler = SubscriptionReconciler::new(store.clone(), provider.clone(), tiers);
        let sweep = ReconciliationSweep::new(store.clone(), reconciler, batch_size);
        (store, provider, sweep)
    }

    #[tokio::test]
    async fn test_sweep_pages_through_linked_profiles() {
        let (store, provider, sweep) = setup(2);
        for i in 0..5 {
            let user = format!("u_{}", i);
            let customer = format!("cus_{}", i);
            store.link_customer(&user, &customer, None).await.unwrap();
            provider
                .set_subscriptions(&customer, vec![active(&customer, "price_pro")])
                .await;
        }
        store.insert_profile(empty_profile("u_unlinked")).await;

        let report = sweep.run().await.unwrap();
        assert_eq!(report.scanned, 5);
        assert_eq!(report.reconciled, 5);
        assert_eq!(report.changed, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(provider.list_calls(), 5);

        let profile = store.get_profile("u_3").await.unwrap().unwrap();
        assert_eq!(profile.snapshot.tier, Tier::Pro);

        // second pass finds nothing to correct
        let again = sweep.run().await.unwrap();
        assert_eq!(again.changed, 0);
        assert_eq!(again.reconciled, 5);
    }

    #[tokio::test]
    async fn test_sweep_counts_failures_without_aborting() {
        let (store, provider, sweep) = setup(10);
        store.link_customer("u_1", "cus_1", None).await.unwrap();
        store.link_customer("u_2", "cus_2", None).await.unwrap();
        provider.set_unavailable(true);

        let report = sweep.run().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.reconciled, 0);
    }

    #[tokio::test]
    async fn test_sweep_empty_store() {
        let (_store, _provider, sweep) = setup(10);
        assert_eq!(sweep.run().await.unwrap(), SweepReport::default());
    }
}
