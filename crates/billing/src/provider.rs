//! Payment provider read access
//!
//! The core only ever reads from the provider: customer metadata for identity
//! resolution and the live subscription list for reconciliation.

use std::future::Future;

use async_trait::async_trait;
use billsync_shared::{SubscriptionStatus, Tier};
use stripe::{
    Customer, CustomerId, Expandable, ListSubscriptions, Subscription,
    SubscriptionStatus as StripeSubStatus, SubscriptionStatusFilter,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::client::{PriceTiers, StripeClient};
use crate::error::{BillingError, BillingResult};

/// Metadata key carrying the internal user id on a provider customer
pub const USER_ID_METADATA_KEY: &str = "user_id";

/// Provider-side customer, reduced to what identity resolution reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    pub id: String,
    /// Back-reference to the internal user, the authoritative link
    pub user_id: Option<String>,
}

/// Provider-side subscription, reduced to what reconciliation reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_ref: String,
    pub status: SubscriptionStatus,
    pub price_ref: Option<String>,
    /// Unix seconds
    pub current_period_end: Option<i64>,
    /// Unix seconds
    pub created: i64,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch a customer. [`BillingError::CustomerNotFound`] when the provider
    /// reports it missing or deleted.
    async fn retrieve_customer(&self, customer_ref: &str) -> BillingResult<ProviderCustomer>;

    /// Live list of every subscription the customer holds, in any status
    async fn list_subscriptions(&self, customer_ref: &str)
        -> BillingResult<Vec<ProviderSubscription>>;
}

/// Number of retries for idempotent provider reads
const READ_RETRIES: usize = 2;

impl StripeClient {
    /// Bound a provider call by the configured request timeout.
    ///
    /// The outer error is the timeout; the inner result is Stripe's own.
    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        fut: F,
    ) -> BillingResult<Result<T, stripe::StripeError>>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        tokio::time::timeout(self.config().request_timeout, fut)
            .await
            .map_err(|_| {
                tracing::warn!(
                    operation,
                    timeout_secs = self.config().request_timeout.as_secs(),
                    "Stripe request timed out"
                );
                BillingError::ProviderUnavailable(format!("{} timed out", operation))
            })
    }

    async fn fetch_subscriptions(
        &self,
        customer_id: &CustomerId,
    ) -> BillingResult<Vec<Subscription>> {
        let mut params = ListSubscriptions::new();
        params.customer = Some(customer_id.clone());
        params.status = Some(SubscriptionStatusFilter::All);
        params.limit = Some(100);

        let list = self
            .bounded(
                "list_subscriptions",
                Subscription::list(self.inner(), &params),
            )
            .await??;

        if list.has_more {
            tracing::warn!(
                customer_id = %customer_id,
                "Customer has more than 100 subscriptions, only the first page is reconciled"
            );
        }

        Ok(list.data)
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_customer(&self, customer_ref: &str) -> BillingResult<ProviderCustomer> {
        let customer_id = parse_customer_id(customer_ref)?;

        let result = self
            .bounded(
                "retrieve_customer",
                Customer::retrieve(self.inner(), &customer_id, &[]),
            )
            .await?;

        let customer = match result {
            Ok(customer) => customer,
            Err(stripe::StripeError::Stripe(err)) if err.http_status == 404 => {
                tracing::info!(customer_ref = %customer_ref, "Stripe customer not found");
                return Err(BillingError::CustomerNotFound(customer_ref.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if customer.deleted {
            return Err(BillingError::CustomerNotFound(customer_ref.to_string()));
        }

        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            user_id: customer
                .metadata
                .as_ref()
                .and_then(|m| m.get(USER_ID_METADATA_KEY))
                .filter(|id| !id.is_empty())
                .cloned(),
        })
    }

    async fn list_subscriptions(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let customer_id = parse_customer_id(customer_ref)?;

        let strategy = ExponentialBackoff::from_millis(50)
            .factor(2)
            .map(jitter)
            .take(READ_RETRIES);

        let subscriptions = RetryIf::spawn(
            strategy,
            || self.fetch_subscriptions(&customer_id),
            |e: &BillingError| e.is_transient(),
        )
        .await
        .map_err(|e| {
            tracing::error!(
                customer_ref = %customer_ref,
                error = %e,
                "Failed to list subscriptions after retries"
            );
            e
        })?;

        Ok(subscriptions
            .iter()
            .map(|s| map_subscription(customer_ref, s, &self.config().price_tiers))
            .collect())
    }
}

fn parse_customer_id(customer_ref: &str) -> BillingResult<CustomerId> {
    customer_ref
        .parse::<CustomerId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))
}

fn map_status(status: &StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

/// Price of the highest-tier item. Items at equal tiers keep the first one listed.
fn highest_tier_price<'a>(
    price_ids: impl IntoIterator<Item = &'a str>,
    tiers: &PriceTiers,
) -> Option<String> {
    price_ids
        .into_iter()
        .fold(None, |best: Option<(&str, Tier)>, price_id| {
            let tier = tiers.tier_for_price(price_id);
            match best {
                Some((_, best_tier)) if best_tier >= tier => best,
                _ => Some((price_id, tier)),
            }
        })
        .map(|(price_id, _)| price_id.to_string())
}

fn map_subscription(
    requested_ref: &str,
    subscription: &Subscription,
    tiers: &PriceTiers,
) -> ProviderSubscription {
    let customer_ref = match &subscription.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };

    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_ref: if customer_ref.is_empty() {
            requested_ref.to_string()
        } else {
            customer_ref
        },
        status: map_status(&subscription.status),
        price_ref: highest_tier_price(
            subscription
                .items
                .data
                .iter()
                .filter_map(|item| item.price.as_ref())
                .map(|price| price.id.as_str()),
            tiers,
        ),
        current_period_end: Some(subscription.current_period_end),
        created: subscription.created,
    }
}
