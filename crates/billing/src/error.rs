//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Customer {customer_ref} is already linked to user {linked_user_id}")]
    Conflict {
        customer_ref: String,
        linked_user_id: String,
    },

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider refused the request; repeating it cannot succeed
    #[error("Payment provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::ProviderUnavailable(_) | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            // 429 is rate limiting, worth retrying
            stripe::StripeError::Stripe(request)
                if (400..500).contains(&request.http_status) && request.http_status != 429 =>
            {
                BillingError::ProviderRejected(err.to_string())
            }
            _ => BillingError::ProviderUnavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::WebhookPayloadInvalid(err.to_string())
    }
}
