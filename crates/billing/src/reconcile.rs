//! Subscription reconciliation
//!
//! The provider's live subscription list is the source of truth. Event
//! payloads only tell us *that* something changed; the stored snapshot is
//! always recomputed from a fresh list, so out-of-order deliveries converge.

use std::sync::Arc;

use billsync_shared::CanonicalSnapshot;
use time::OffsetDateTime;

use crate::client::PriceTiers;
use crate::error::BillingResult;
use crate::provider::{BillingProvider, ProviderSubscription};
use crate::store::ProfileStore;

/// Pick the subscription that defines the user's entitlement.
///
/// Only active-like subscriptions count. Among those the highest tier wins,
/// then the most recently created. No candidate yields the free snapshot.
pub fn select_canonical(
    subscriptions: &[ProviderSubscription],
    price_tiers: &PriceTiers,
) -> CanonicalSnapshot {
    let winner = subscriptions
        .iter()
        .filter(|sub| sub.status.is_active_like())
        .map(|sub| {
            let tier = sub
                .price_ref
                .as_deref()
                .map(|price| price_tiers.tier_for_price(price))
                .unwrap_or_default();
            (tier, sub)
        })
        .max_by(|(a_tier, a), (b_tier, b)| {
            a_tier
                .cmp(b_tier)
                .then(a.created.cmp(&b.created))
                // stable pick when timestamps collide
                .then(b.id.cmp(&a.id))
        });

    match winner {
        Some((tier, sub)) => CanonicalSnapshot {
            status: sub.status,
            tier,
            price_ref: sub.price_ref.clone(),
            subscription_ref: Some(sub.id.clone()),
            period_end: sub
                .current_period_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        },
        None => CanonicalSnapshot::free(),
    }
}

#[derive(Clone)]
pub struct SubscriptionReconciler {
    profiles: Arc<dyn ProfileStore>,
    provider: Arc<dyn BillingProvider>,
    price_tiers: PriceTiers,
}

impl SubscriptionReconciler {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        provider: Arc<dyn BillingProvider>,
        price_tiers: PriceTiers,
    ) -> Self {
        Self {
            profiles,
            provider,
            price_tiers,
        }
    }

    /// Recompute and store the user's snapshot from the provider.
    ///
    /// A user without a linked customer is reset to free. Provider failures
    /// leave the stored snapshot untouched.
    pub async fn reconcile(&self, user_id: &str) -> BillingResult<CanonicalSnapshot> {
        let customer_ref = self
            .profiles
            .get_profile(user_id)
            .await?
            .and_then(|profile| profile.customer_ref);

        match customer_ref {
            Some(customer_ref) => self.reconcile_customer(user_id, &customer_ref).await,
            None => {
                let snapshot = CanonicalSnapshot::free();
                self.profiles.save_snapshot(user_id, &snapshot).await?;
                tracing::info!(user_id = %user_id, "No linked customer, snapshot reset to free");
                Ok(snapshot)
            }
        }
    }

    /// Same as [`reconcile`](Self::reconcile) when the caller already holds the reference
    pub async fn reconcile_customer(
        &self,
        user_id: &str,
        customer_ref: &str,
    ) -> BillingResult<CanonicalSnapshot> {
        let subscriptions = self.provider.list_subscriptions(customer_ref).await?;
        let snapshot = select_canonical(&subscriptions, &self.price_tiers);

        self.profiles.save_snapshot(user_id, &snapshot).await?;

        tracing::info!(
            user_id = %user_id,
            customer_ref = %customer_ref,
            subscriptions = subscriptions.len(),
            tier = %snapshot.tier,
            status = %snapshot.status,
            subscription_ref = ?snapshot.subscription_ref,
            "Subscription reconciled"
        );

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBillingStore, InMemoryProvider};
    use billsync_shared::{SubscriptionStatus, Tier};

    fn tiers() -> PriceTiers {
        PriceTiers::new()
            .with_price("price_baby", Tier::Baby)
            .with_price("price_premium", Tier::Premium)
            .with_price("price_pro", Tier::Pro)
    }

    fn sub(id: &str, status: SubscriptionStatus, price: &str, created: i64) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            customer_ref: "cus_1".to_string(),
            status,
            price_ref: Some(price.to_string()),
            current_period_end: Some(created + 2_592_000),
            created,
        }
    }

    // ==========================================================================
    // select_canonical
    // ==========================================================================

    #[test]
    fn test_empty_list_is_free() {
        assert_eq!(select_canonical(&[], &tiers()), CanonicalSnapshot::free());
    }

    #[test]
    fn test_only_inactive_is_free() {
        let subs = vec![
            sub("sub_1", SubscriptionStatus::Canceled, "price_pro", 10),
            sub("sub_2", SubscriptionStatus::IncompleteExpired, "price_pro", 20),
            sub("sub_3", SubscriptionStatus::Unpaid, "price_premium", 30),
        ];
        assert_eq!(select_canonical(&subs, &tiers()), CanonicalSnapshot::free());
    }

    #[test]
    fn test_highest_tier_wins() {
        let subs = vec![
            sub("sub_baby", SubscriptionStatus::Active, "price_baby", 300),
            sub("sub_pro", SubscriptionStatus::Active, "price_pro", 100),
            sub("sub_premium", SubscriptionStatus::Trialing, "price_premium", 200),
        ];
        let snapshot = select_canonical(&subs, &tiers());
        assert_eq!(snapshot.tier, Tier::Pro);
        assert_eq!(snapshot.subscription_ref.as_deref(), Some("sub_pro"));
        assert_eq!(snapshot.price_ref.as_deref(), Some("price_pro"));
        assert_eq!(
            snapshot.period_end.map(|t| t.unix_timestamp()),
            Some(100 + 2_592_000)
        );
    }

    #[test]
    fn test_same_tier_latest_created_wins() {
        let subs = vec![
            sub("sub_old", SubscriptionStatus::Active, "price_premium", 100),
            sub("sub_new", SubscriptionStatus::PastDue, "price_premium", 200),
        ];
        let snapshot = select_canonical(&subs, &tiers());
        assert_eq!(snapshot.subscription_ref.as_deref(), Some("sub_new"));
        assert_eq!(snapshot.status, SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_selection_ignores_input_order() {
        let mut subs = vec![
            sub("sub_a", SubscriptionStatus::Active, "price_baby", 1),
            sub("sub_b", SubscriptionStatus::Active, "price_premium", 2),
            sub("sub_c", SubscriptionStatus::Canceled, "price_pro", 3),
        ];
        let forward = select_canonical(&subs, &tiers());
        subs.reverse();
        assert_eq!(select_canonical(&subs, &tiers()), forward);
        assert_eq!(forward.subscription_ref.as_deref(), Some("sub_b"));
    }

    #[test]
    fn test_unmapped_price_counts_as_free_tier() {
        let subs = vec![sub("sub_x", SubscriptionStatus::Active, "price_legacy", 1)];
        let snapshot = select_canonical(&subs, &tiers());
        assert_eq!(snapshot.tier, Tier::Free);
        assert_eq!(snapshot.status, SubscriptionStatus::Active);
        assert_eq!(snapshot.subscription_ref.as_deref(), Some("sub_x"));
    }

    // ==========================================================================
    // SubscriptionReconciler
    // ==========================================================================

    fn setup() -> (
        Arc<InMemoryBillingStore>,
        Arc<InMemoryProvider>,
        SubscriptionReconciler,
    ) {
        let store = Arc::new(InMemoryBillingStore::new());
        let provider = Arc::new(InMemoryProvider::new());
        let reconciler = SubscriptionReconciler::new(store.clone(), provider.clone(), tiers());
        (store, provider, reconciler)
    }

    #[tokio::test]
    async fn test_reconcile_persists_snapshot() {
        let (store, provider, reconciler) = setup();
        store.link_customer("u_1", "cus_1", None).await.unwrap();
        provider
            .set_subscriptions(
                "cus_1",
                vec![sub("sub_1", SubscriptionStatus::Active, "price_premium", 50)],
            )
            .await;

        let snapshot = reconciler.reconcile("u_1").await.unwrap();
        assert_eq!(snapshot.tier, Tier::Premium);

        let profile = store.get_profile("u_1").await.unwrap().unwrap();
        assert_eq!(profile.snapshot, snapshot);
        assert!(profile.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_unlinked_user_is_free() {
        let (store, provider, reconciler) = setup();

        let snapshot = reconciler.reconcile("u_nobody").await.unwrap();
        assert_eq!(snapshot, CanonicalSnapshot::free());
        assert_eq!(provider.list_calls(), 0);
        assert!(store.get_profile("u_nobody").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_provider_failure_writes_nothing() {
        let (store, provider, reconciler) = setup();
        store.link_customer("u_1", "cus_1", None).await.unwrap();
        provider
            .set_subscriptions(
                "cus_1",
                vec![sub("sub_1", SubscriptionStatus::Active, "price_pro", 50)],
            )
            .await;
        let before = reconciler.reconcile("u_1").await.unwrap();

        provider.set_subscriptions("cus_1", vec![]).await;
        provider.set_unavailable(true);

        let err = reconciler.reconcile("u_1").await.unwrap_err();
        assert!(err.is_transient());

        let profile = store.get_profile("u_1").await.unwrap().unwrap();
        assert_eq!(profile.snapshot, before);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (store, provider, reconciler) = setup();
        store.link_customer("u_1", "cus_1", None).await.unwrap();
        provider
            .set_subscriptions(
                "cus_1",
                vec![
                    sub("sub_1", SubscriptionStatus::Active, "price_baby", 1),
                    sub("sub_2", SubscriptionStatus::Active, "price_pro", 2),
                ],
            )
            .await;

        let first = reconciler.reconcile("u_1").await.unwrap();
        let second = reconciler.reconcile("u_1").await.unwrap();
        assert_eq!(first, second);
    }
}
