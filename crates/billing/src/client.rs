//! Stripe client and configuration

use std::collections::HashMap;
use std::time::Duration;

use billsync_shared::Tier;

use crate::error::{BillingError, BillingResult};

/// Default webhook timestamp tolerance (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Default bound on a single provider API call
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Static price → tier mapping
///
/// Injected into the reconciler instead of being looked up from the
/// environment at decision time. Unmapped prices resolve to [`Tier::Free`].
#[derive(Debug, Clone, Default)]
pub struct PriceTiers {
    by_price: HashMap<String, Tier>,
}

impl PriceTiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration of a price id
    pub fn with_price(mut self, price_id: impl Into<String>, tier: Tier) -> Self {
        self.insert(price_id, tier);
        self
    }

    pub fn insert(&mut self, price_id: impl Into<String>, tier: Tier) {
        let price_id = price_id.into();
        if let Some(previous) = self.by_price.insert(price_id.clone(), tier) {
            if previous != tier {
                tracing::warn!(
                    price_id = %price_id,
                    previous = %previous,
                    tier = %tier,
                    "Price id mapped to more than one tier, keeping the last mapping"
                );
            }
        }
    }

    pub fn tier_for_price(&self, price_id: &str) -> Tier {
        self.by_price.get(price_id).copied().unwrap_or(Tier::Free)
    }

    pub fn len(&self) -> usize {
        self.by_price.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_price.is_empty()
    }

    /// Read `STRIPE_PRICE_BABY`, `STRIPE_PRICE_PREMIUM` and `STRIPE_PRICE_PRO`.
    /// Each holds a comma-separated list (monthly and annual prices, for example).
    pub fn from_env() -> Self {
        let mut tiers = Self::new();
        for (var, tier) in [
            ("STRIPE_PRICE_BABY", Tier::Baby),
            ("STRIPE_PRICE_PREMIUM", Tier::Premium),
            ("STRIPE_PRICE_PRO", Tier::Pro),
        ] {
            if let Ok(value) = std::env::var(var) {
                for price_id in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    tiers.insert(price_id, tier);
                }
            }
        }
        tiers
    }
}

/// Stripe configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_tiers: PriceTiers,
    pub webhook_tolerance: Duration,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .field("price_tiers", &self.price_tiers)
            .field("webhook_tolerance", &self.webhook_tolerance)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = required_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = required_env("STRIPE_WEBHOOK_SECRET")?;

        let price_tiers = PriceTiers::from_env();
        if price_tiers.is_empty() {
            tracing::warn!("No STRIPE_PRICE_* variables set - every subscription will map to free");
        } else {
            tracing::info!(prices = price_tiers.len(), "Price tier mapping loaded");
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            price_tiers,
            webhook_tolerance: Duration::from_secs(env_u64(
                "STRIPE_WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )?),
            request_timeout: Duration::from_secs(env_u64(
                "STRIPE_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
        })
    }
}

fn required_env(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{} must be set", name))),
    }
}

fn env_u64(name: &str, default: u64) -> BillingResult<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} must be a whole number", name))),
        Err(_) => Ok(default),
    }
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
