//! In-memory store and provider doubles
//!
//! Behave like the Postgres store and the Stripe client closely enough to
//! exercise the webhook pipeline without a database or network: unique
//! customer references, append-only ledger, call counters and failure
//! injection on the provider.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use billsync_shared::CanonicalSnapshot;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, ProviderCustomer, ProviderSubscription};
use crate::store::{
    EventLedgerStore, InsertOutcome, NewProcessedEvent, ProcessedEvent, ProfileRecord,
    ProfileStore,
};

#[derive(Default)]
pub struct InMemoryBillingStore {
    profiles: Mutex<BTreeMap<String, ProfileRecord>>,
    events: Mutex<HashMap<String, ProcessedEvent>>,
    fail_writes: AtomicBool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a profile as the auth collaborator would create it
    pub async fn insert_profile(&self, profile: ProfileRecord) {
        self.profiles
            .lock()
            .await
            .insert(profile.user_id.clone(), profile);
    }

    /// Make profile writes fail with a database error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn event_count(&self) -> usize {
        self.events.lock().await.len()
    }

    fn check_writes(&self) -> BillingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database("simulated write failure".to_string()));
        }
        Ok(())
    }
}

pub fn empty_profile(user_id: &str) -> ProfileRecord {
    ProfileRecord {
        user_id: user_id.to_string(),
        billing_email: None,
        customer_ref: None,
        snapshot: CanonicalSnapshot::free(),
        synced_at: None,
    }
}

#[async_trait]
impl ProfileStore for InMemoryBillingStore {
    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<ProfileRecord>> {
        Ok(self.profiles.lock().await.get(user_id).cloned())
    }

    async fn find_user_by_customer(&self, customer_ref: &str) -> BillingResult<Option<String>> {
        Ok(self
            .profiles
            .lock()
            .await
            .values()
            .find(|p| p.customer_ref.as_deref() == Some(customer_ref))
            .map(|p| p.user_id.clone()))
    }

    async fn link_customer(
        &self,
        user_id: &str,
        customer_ref: &str,
        billing_email: Option<&str>,
    ) -> BillingResult<()> {
        self.check_writes()?;
        let mut profiles = self.profiles.lock().await;

        if let Some(other) = profiles
            .values()
            .find(|p| p.customer_ref.as_deref() == Some(customer_ref) && p.user_id != user_id)
        {
            return Err(BillingError::Conflict {
                customer_ref: customer_ref.to_string(),
                linked_user_id: other.user_id.clone(),
            });
        }

        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| empty_profile(user_id));
        profile.customer_ref = Some(customer_ref.to_string());
        if let Some(email) = billing_email {
            profile.billing_email = Some(email.to_string());
        }
        Ok(())
    }

    async fn unlink_customer(&self, customer_ref: &str) -> BillingResult<Option<String>> {
        self.check_writes()?;
        let mut profiles = self.profiles.lock().await;
        Ok(profiles
            .values_mut()
            .find(|p| p.customer_ref.as_deref() == Some(customer_ref))
            .map(|p| {
                p.customer_ref = None;
                p.user_id.clone()
            }))
    }

    async fn save_snapshot(
        &self,
        user_id: &str,
        snapshot: &CanonicalSnapshot,
    ) -> BillingResult<()> {
        self.check_writes()?;
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| empty_profile(user_id));
        profile.snapshot = snapshot.clone();
        profile.synced_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn list_linked_profiles(
        &self,
        after_user_id: Option<&str>,
        limit: i64,
    ) -> BillingResult<Vec<ProfileRecord>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .profiles
            .lock()
            .await
            .values()
            .filter(|p| p.customer_ref.is_some())
            .filter(|p| after_user_id.map_or(true, |after| p.user_id.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventLedgerStore for InMemoryBillingStore {
    async fn event_exists(&self, event_id: &str) -> BillingResult<bool> {
        Ok(self.events.lock().await.contains_key(event_id))
    }

    async fn insert_event(&self, event: &NewProcessedEvent) -> BillingResult<InsertOutcome> {
        let mut events = self.events.lock().await;
        if events.contains_key(&event.event_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        events.insert(
            event.event_id.clone(),
            ProcessedEvent {
                id: Uuid::new_v4(),
                stripe_event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                user_id: event.user_id.clone(),
                payment_type: event.payment_type.clone(),
                amount_cents: event.amount_cents,
                currency: event.currency.clone(),
                raw_payload: event.raw_payload.clone(),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        Ok(self.events.lock().await.get(event_id).cloned())
    }
}

/// Scriptable provider with per-operation call counters
#[derive(Default)]
pub struct InMemoryProvider {
    customers: Mutex<HashMap<String, ProviderCustomer>>,
    subscriptions: Mutex<HashMap<String, Vec<ProviderSubscription>>>,
    unavailable: AtomicBool,
    retrieve_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_customer(&self, id: &str, user_id: Option<&str>) {
        self.customers.lock().await.insert(
            id.to_string(),
            ProviderCustomer {
                id: id.to_string(),
                user_id: user_id.map(str::to_string),
            },
        );
    }

    /// Replace the customer's subscription list
    pub async fn set_subscriptions(&self, customer_ref: &str, subs: Vec<ProviderSubscription>) {
        self.subscriptions
            .lock()
            .await
            .insert(customer_ref.to_string(), subs);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderUnavailable(
                "simulated provider outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for InMemoryProvider {
    async fn retrieve_customer(&self, customer_ref: &str) -> BillingResult<ProviderCustomer> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.customers
            .lock()
            .await
            .get(customer_ref)
            .cloned()
            .ok_or_else(|| BillingError::CustomerNotFound(customer_ref.to_string()))
    }

    async fn list_subscriptions(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .subscriptions
            .lock()
            .await
            .get(customer_ref)
            .cloned()
            .unwrap_or_default())
    }
}
