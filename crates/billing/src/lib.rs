// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::Conflict carries both identities
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! billsync billing core
//!
//! Ingests Stripe webhooks and keeps a canonical subscription snapshot per
//! user in step with the provider.
//!
//! ## Components
//!
//! - **Verification**: `Stripe-Signature` HMAC check and typed event parsing
//! - **Deduplication ledger**: append-only processed-event table
//! - **Identity resolution**: customer reference to user id, with provider metadata fallback
//! - **Reconciliation**: highest active tier wins, re-derived from the live subscription list
//! - **Webhooks**: plan, claim, then execute side effects
//! - **Sync trigger**: on-demand reconcile with cached fallback
//! - **Sweep**: periodic reconcile of every linked user

pub mod client;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod sweep;
pub mod sync;
pub mod verify;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod memory;


// Client
pub use client::{PriceTiers, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    CheckoutMode, CheckoutSession, EventPayload, InvoiceObject, InvoiceOutcome,
    SubscriptionObject, WebhookEvent,
};

// Identity
pub use identity::{IdentityResolver, Resolution};

// Ledger
pub use ledger::{ClaimOutcome, DedupLedger};

// Provider
pub use provider::{BillingProvider, ProviderCustomer, ProviderSubscription, USER_ID_METADATA_KEY};

// Reconcile
pub use reconcile::{select_canonical, SubscriptionReconciler};

// Store
pub use store::{
    EventLedgerStore, InsertOutcome, NewProcessedEvent, PgBillingStore, ProcessedEvent,
    ProfileRecord, ProfileStore,
};

// Sweep
pub use sweep::{ReconciliationSweep, SweepReport, DEFAULT_SWEEP_BATCH_SIZE};

// Sync
pub use sync::{SyncResult, SyncTrigger, DEFAULT_SYNC_TIMEOUT_SECS};

// Verify
pub use verify::{sign_payload, EventVerifier};

// Webhooks
pub use webhooks::{HandlerOutcome, WebhookHandler, WebhookOutcome};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

/// Main billing service that wires the components together
#[derive(Clone)]
pub struct BillingService {
    pub identity: IdentityResolver,
    pub ledger: DedupLedger,
    pub reconciler: SubscriptionReconciler,
    pub sweep: ReconciliationSweep,
    pub sync: SyncTrigger,
    pub webhooks: WebhookHandler,
    profiles: Arc<dyn ProfileStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let store = Arc::new(PgBillingStore::new(pool));
        let stripe = Arc::new(StripeClient::new(config.clone()));
        Self::with_components(config, store.clone(), store, stripe)
    }

    /// Wire the service over arbitrary store and provider implementations
    pub fn with_components(
        config: StripeConfig,
        profiles: Arc<dyn ProfileStore>,
        events: Arc<dyn EventLedgerStore>,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        let verifier = EventVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance);
        let ledger = DedupLedger::new(events);
        let identity = IdentityResolver::new(profiles.clone(), provider.clone());
        let reconciler =
            SubscriptionReconciler::new(profiles.clone(), provider, config.price_tiers.clone());
        let sync = SyncTrigger::new(
            profiles.clone(),
            reconciler.clone(),
            Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
        );
        let sweep = ReconciliationSweep::new(
            profiles.clone(),
            reconciler.clone(),
            DEFAULT_SWEEP_BATCH_SIZE,
        );
        let webhooks = WebhookHandler::new(
            verifier,
            ledger.clone(),
            identity.clone(),
            reconciler.clone(),
        );

        Self {
            identity,
            ledger,
            reconciler,
            sweep,
            sync,
            webhooks,
            profiles,
        }
    }

    /// Override the forced-sync bound
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync = SyncTrigger::new(self.profiles.clone(), self.reconciler.clone(), timeout);
        self
    }

    /// Override the number of profiles the sweep loads per page
    pub fn with_sweep_batch_size(mut self, batch_size: i64) -> Self {
        self.sweep =
            ReconciliationSweep::new(self.profiles.clone(), self.reconciler.clone(), batch_size);
        self
    }
}
