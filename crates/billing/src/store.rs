//! Persistent store for billing profiles and the processed-event ledger
//!
//! Both tables are written with insert/upsert statements guarded by unique
//! constraints, never read-modify-write, so no transaction spans rows.

use async_trait::async_trait;
use billsync_shared::{CanonicalSnapshot, SubscriptionStatus, Tier};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A user's billing profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub user_id: String,
    pub billing_email: Option<String>,
    pub customer_ref: Option<String>,
    pub snapshot: CanonicalSnapshot,
    pub synced_at: Option<OffsetDateTime>,
}

/// Ledger row as written at claim time
#[derive(Debug, Clone, PartialEq)]
pub struct NewProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub user_id: Option<String>,
    /// `subscription`, `one_time` or `invoice`
    pub payment_type: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub raw_payload: serde_json::Value,
}

/// Stored ledger row
#[derive(Debug, Clone, PartialEq, serde::Serialize, sqlx::FromRow)]
pub struct ProcessedEvent {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub user_id: Option<String>,
    pub payment_type: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub raw_payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Result of a uniqueness-constrained ledger insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<ProfileRecord>>;

    /// Exact match on the stored customer reference
    async fn find_user_by_customer(&self, customer_ref: &str) -> BillingResult<Option<String>>;

    /// Upsert keyed by user id. Fails with [`BillingError::Conflict`] when the
    /// customer reference already belongs to another user.
    async fn link_customer(
        &self,
        user_id: &str,
        customer_ref: &str,
        billing_email: Option<&str>,
    ) -> BillingResult<()>;

    /// Clear a customer reference, returning the user it was linked to
    async fn unlink_customer(&self, customer_ref: &str) -> BillingResult<Option<String>>;

    /// Overwrite the stored snapshot (last reconcile wins)
    async fn save_snapshot(&self, user_id: &str, snapshot: &CanonicalSnapshot)
        -> BillingResult<()>;

    /// Page through profiles that carry a customer reference, ordered by user id
    async fn list_linked_profiles(
        &self,
        after_user_id: Option<&str>,
        limit: i64,
    ) -> BillingResult<Vec<ProfileRecord>>;
}

#[async_trait]
pub trait EventLedgerStore: Send + Sync {
    async fn event_exists(&self, event_id: &str) -> BillingResult<bool>;

    async fn insert_event(&self, event: &NewProcessedEvent) -> BillingResult<InsertOutcome>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>>;
}

/// Row type for billing_profiles
#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    user_id: String,
    billing_email: Option<String>,
    stripe_customer_id: Option<String>,
    subscription_status: String,
    subscription_tier: String,
    subscription_price_id: Option<String>,
    stripe_subscription_id: Option<String>,
    subscription_period_end: Option<OffsetDateTime>,
    synced_at: Option<OffsetDateTime>,
}

impl From<ProfileRow> for ProfileRecord {
    fn from(row: ProfileRow) -> Self {
        // Unknown stored values degrade to the free snapshot fields rather than
        // failing the read; the next reconcile rewrites them.
        let status = row
            .subscription_status
            .parse::<SubscriptionStatus>()
            .unwrap_or_else(|e| {
                tracing::warn!(user_id = %row.user_id, error = %e, "Unreadable stored status");
                SubscriptionStatus::None
            });
        let tier = row.subscription_tier.parse::<Tier>().unwrap_or_else(|e| {
            tracing::warn!(user_id = %row.user_id, error = %e, "Unreadable stored tier");
            Tier::Free
        });

        ProfileRecord {
            user_id: row.user_id,
            billing_email: row.billing_email,
            customer_ref: row.stripe_customer_id,
            snapshot: CanonicalSnapshot {
                status,
                tier,
                price_ref: row.subscription_price_id,
                subscription_ref: row.stripe_subscription_id,
                period_end: row.subscription_period_end,
            },
            synced_at: row.synced_at,
        }
    }
}

const PROFILE_COLUMNS: &str = r#"
    user_id, billing_email, stripe_customer_id, subscription_status, subscription_tier,
    subscription_price_id, stripe_subscription_id, subscription_period_end, synced_at
"#;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[async_trait]
impl ProfileStore for PgBillingStore {
    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<ProfileRecord>> {
        let row: Option<ProfileRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_profiles WHERE user_id = $1",
            PROFILE_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ProfileRecord::from))
    }

    async fn find_user_by_customer(&self, customer_ref: &str) -> BillingResult<Option<String>> {
        let result: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM billing_profiles WHERE stripe_customer_id = $1")
                .bind(customer_ref)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.map(|(id,)| id))
    }

    async fn link_customer(
        &self,
        user_id: &str,
        customer_ref: &str,
        billing_email: Option<&str>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_profiles (user_id, stripe_customer_id, billing_email, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                billing_email = COALESCE(EXCLUDED.billing_email, billing_profiles.billing_email),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(customer_ref)
        .bind(billing_email)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let linked_user_id = self
                    .find_user_by_customer(customer_ref)
                    .await?
                    .unwrap_or_default();
                Err(BillingError::Conflict {
                    customer_ref: customer_ref.to_string(),
                    linked_user_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlink_customer(&self, customer_ref: &str) -> BillingResult<Option<String>> {
        let result: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE billing_profiles
            SET stripe_customer_id = NULL, updated_at = NOW()
            WHERE stripe_customer_id = $1
            RETURNING user_id
            "#,
        )
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.map(|(id,)| id))
    }

    async fn save_snapshot(
        &self,
        user_id: &str,
        snapshot: &CanonicalSnapshot,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_profiles (
                user_id, subscription_status, subscription_tier, subscription_price_id,
                stripe_subscription_id, subscription_period_end, synced_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                subscription_status = EXCLUDED.subscription_status,
                subscription_tier = EXCLUDED.subscription_tier,
                subscription_price_id = EXCLUDED.subscription_price_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                subscription_period_end = EXCLUDED.subscription_period_end,
                synced_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(snapshot.status.as_str())
        .bind(snapshot.tier.as_str())
        .bind(snapshot.price_ref.as_deref())
        .bind(snapshot.subscription_ref.as_deref())
        .bind(snapshot.period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_linked_profiles(
        &self,
        after_user_id: Option<&str>,
        limit: i64,
    ) -> BillingResult<Vec<ProfileRecord>> {
        let rows: Vec<ProfileRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM billing_profiles
            WHERE stripe_customer_id IS NOT NULL
              AND ($1::TEXT IS NULL OR user_id > $1)
            ORDER BY user_id
            LIMIT $2
            "#,
            PROFILE_COLUMNS
        ))
        .bind(after_user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ProfileRecord::from).collect())
    }
}

#[async_trait]
impl EventLedgerStore for PgBillingStore {
    async fn event_exists(&self, event_id: &str) -> BillingResult<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE stripe_event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists.0)
    }

    async fn insert_event(&self, event: &NewProcessedEvent) -> BillingResult<InsertOutcome> {
        // ON CONFLICT DO NOTHING RETURNING: only one concurrent delivery gets a row back
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_events
                (id, stripe_event_id, event_type, user_id, payment_type, amount_cents, currency, raw_payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.user_id.as_deref())
        .bind(event.payment_type.as_deref())
        .bind(event.amount_cents)
        .bind(event.currency.as_deref())
        .bind(&event.raw_payload)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::Duplicate,
        })
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<ProcessedEvent>> {
        let row: Option<ProcessedEvent> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, user_id, payment_type, amount_cents,
                   currency, raw_payload, created_at
            FROM processed_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
