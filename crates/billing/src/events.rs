//! Typed webhook events
//!
//! Provider payloads are parsed once, at the verification boundary, into a
//! closed set of variants carrying only the fields the dispatcher reads.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::provider::USER_ID_METADATA_KEY;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const CUSTOMER_DELETED: &str = "customer.deleted";

/// A verified, parsed provider event
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub livemode: bool,
    pub payload: EventPayload,
    /// Exact parsed body, kept for the audit ledger
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CheckoutCompleted(CheckoutSession),
    /// Created, updated or deleted: all trigger a full reconcile
    SubscriptionChanged(SubscriptionObject),
    InvoiceSettled {
        outcome: InvoiceOutcome,
        invoice: InvoiceObject,
    },
    CustomerDeleted {
        customer_ref: String,
    },
    Unhandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceOutcome {
    Paid,
    PaymentFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    Subscription,
    Payment,
    Setup,
}

impl CheckoutMode {
    /// Audit payment type recorded for this checkout
    pub fn payment_type(&self) -> &'static str {
        match self {
            CheckoutMode::Subscription => "subscription",
            CheckoutMode::Payment | CheckoutMode::Setup => "one_time",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub mode: CheckoutMode,
    pub customer_ref: Option<String>,
    pub customer_email: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    /// User id carried on the session itself (`client_reference_id` or metadata)
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer_ref: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceObject {
    pub id: String,
    pub customer_ref: Option<String>,
    pub amount_cents: i64,
    pub currency: Option<String>,
}

// Wire shapes. Unknown fields are ignored.

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    livemode: bool,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// A reference the provider may send as a bare id or an expanded object
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    mode: Option<String>,
    customer: Option<Expandable>,
    customer_email: Option<String>,
    customer_details: Option<RawCustomerDetails>,
    amount_total: Option<i64>,
    currency: Option<String>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct RawCustomerDetails {
    email: Option<String>,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    customer: Expandable,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    customer: Option<Expandable>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    currency: Option<String>,
}

#[derive(Deserialize)]
struct RawCustomer {
    id: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn object_as<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| {
        BillingError::WebhookPayloadInvalid(format!("{} object: {}", event_type, e))
    })
}

impl WebhookEvent {
    /// Parse an event body. Fails with [`BillingError::WebhookPayloadInvalid`].
    pub fn parse(raw_body: &[u8]) -> BillingResult<Self> {
        let raw: serde_json::Value = serde_json::from_slice(raw_body)?;
        let envelope: RawEvent = serde_json::from_value(raw.clone())?;

        if envelope.id.is_empty() {
            return Err(BillingError::WebhookPayloadInvalid(
                "event id is empty".to_string(),
            ));
        }

        let payload = parse_payload(&envelope.event_type, envelope.data.object)?;

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            livemode: envelope.livemode,
            payload,
            raw,
        })
    }

    /// Provider customer reference the event concerns, if any
    pub fn customer_ref(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::CheckoutCompleted(session) => session.customer_ref.as_deref(),
            EventPayload::SubscriptionChanged(subscription) => {
                Some(subscription.customer_ref.as_str())
            }
            EventPayload::InvoiceSettled { invoice, .. } => invoice.customer_ref.as_deref(),
            EventPayload::CustomerDeleted { customer_ref } => Some(customer_ref.as_str()),
            EventPayload::Unhandled => None,
        }
    }
}

fn parse_payload(event_type: &str, object: serde_json::Value) -> BillingResult<EventPayload> {
    let payload = match event_type {
        CHECKOUT_SESSION_COMPLETED => {
            let session: RawCheckoutSession = object_as(event_type, object)?;
            let mode = match session.mode.as_deref() {
                Some("subscription") => CheckoutMode::Subscription,
                Some("setup") => CheckoutMode::Setup,
                _ => CheckoutMode::Payment,
            };
            let user_id = non_empty(session.client_reference_id).or_else(|| {
                non_empty(
                    session
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get(USER_ID_METADATA_KEY))
                        .cloned(),
                )
            });
            EventPayload::CheckoutCompleted(CheckoutSession {
                id: session.id,
                mode,
                customer_ref: session.customer.map(Expandable::into_id),
                customer_email: non_empty(session.customer_email)
                    .or_else(|| non_empty(session.customer_details.and_then(|d| d.email))),
                amount_total: session.amount_total,
                currency: session.currency,
                user_id,
            })
        }
        SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED | SUBSCRIPTION_DELETED => {
            // Status and prices are re-read from the provider when reconciling
            let subscription: RawSubscription = object_as(event_type, object)?;
            EventPayload::SubscriptionChanged(SubscriptionObject {
                id: subscription.id,
                customer_ref: subscription.customer.into_id(),
            })
        }
        INVOICE_PAID | INVOICE_PAYMENT_SUCCEEDED | INVOICE_PAYMENT_FAILED => {
            let outcome = if event_type == INVOICE_PAYMENT_FAILED {
                InvoiceOutcome::PaymentFailed
            } else {
                InvoiceOutcome::Paid
            };
            let invoice: RawInvoice = object_as(event_type, object)?;
            let amount_cents = match outcome {
                InvoiceOutcome::Paid => invoice.amount_paid,
                InvoiceOutcome::PaymentFailed => invoice.amount_due,
            };
            EventPayload::InvoiceSettled {
                outcome,
                invoice: InvoiceObject {
                    id: invoice.id,
                    customer_ref: invoice.customer.map(Expandable::into_id),
                    amount_cents,
                    currency: invoice.currency,
                },
            }
        }
        CUSTOMER_DELETED => {
            let customer: RawCustomer = object_as(event_type, object)?;
            EventPayload::CustomerDeleted {
                customer_ref: customer.id,
            }
        }
        _ => EventPayload::Unhandled,
    };

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(event_type: &str, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "object": "event",
            "type": event_type,
            "created": 1_700_000_000,
            "livemode": false,
            "api_version": "2024-06-20",
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_checkout_session() {
        let event = WebhookEvent::parse(&body(
            CHECKOUT_SESSION_COMPLETED,
            json!({
                "id": "cs_1",
                "object": "checkout.session",
                "mode": "subscription",
                "customer": "cus_1",
                "customer_details": { "email": "a@example.com" },
                "amount_total": 999,
                "currency": "usd",
                "metadata": { "user_id": "u_1" }
            }),
        ))
        .unwrap();

        assert_eq!(event.id, "evt_1");
        assert_eq!(event.customer_ref(), Some("cus_1"));
        match event.payload {
            EventPayload::CheckoutCompleted(session) => {
                assert_eq!(session.mode, CheckoutMode::Subscription);
                assert_eq!(session.customer_email.as_deref(), Some("a@example.com"));
                assert_eq!(session.user_id.as_deref(), Some("u_1"));
                assert_eq!(session.amount_total, Some(999));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_client_reference_id_wins_over_metadata() {
        let event = WebhookEvent::parse(&body(
            CHECKOUT_SESSION_COMPLETED,
            json!({
                "id": "cs_2",
                "mode": "payment",
                "client_reference_id": "u_ref",
                "metadata": { "user_id": "u_meta" }
            }),
        ))
        .unwrap();

        let EventPayload::CheckoutCompleted(session) = event.payload else {
            panic!("expected checkout payload");
        };
        assert_eq!(session.user_id.as_deref(), Some("u_ref"));
        assert_eq!(session.mode.payment_type(), "one_time");
        assert!(session.customer_ref.is_none());
    }

    #[test]
    fn test_parse_subscription_with_expanded_customer() {
        let event = WebhookEvent::parse(&body(
            SUBSCRIPTION_UPDATED,
            json!({
                "id": "sub_1",
                "customer": { "id": "cus_9", "object": "customer" },
                "status": "past_due",
                "items": {
                    "object": "list",
                    "data": [ { "price": { "id": "price_pro" }, "current_period_end": 1_800_000_000 } ]
                }
            }),
        ))
        .unwrap();

        assert_eq!(
            event.payload,
            EventPayload::SubscriptionChanged(SubscriptionObject {
                id: "sub_1".to_string(),
                customer_ref: "cus_9".to_string(),
            })
        );
        assert_eq!(event.customer_ref(), Some("cus_9"));
    }

    #[test]
    fn test_unknown_subscription_status_is_accepted() {
        for event_type in [SUBSCRIPTION_CREATED, SUBSCRIPTION_DELETED] {
            let event = WebhookEvent::parse(&body(
                event_type,
                json!({ "id": "sub_2", "customer": "cus_2", "status": "frozen" }),
            ))
            .unwrap();
            assert!(matches!(
                event.payload,
                EventPayload::SubscriptionChanged(ref s) if s.customer_ref == "cus_2"
            ));
        }
    }

    #[test]
    fn test_invoice_amount_depends_on_outcome() {
        let object = json!({
            "id": "in_1",
            "customer": "cus_1",
            "amount_paid": 0,
            "amount_due": 1500,
            "currency": "eur"
        });

        let failed = WebhookEvent::parse(&body(INVOICE_PAYMENT_FAILED, object.clone())).unwrap();
        let EventPayload::InvoiceSettled { outcome, invoice } = failed.payload else {
            panic!("expected invoice payload");
        };
        assert_eq!(outcome, InvoiceOutcome::PaymentFailed);
        assert_eq!(invoice.amount_cents, 1500);

        let paid = WebhookEvent::parse(&body(INVOICE_PAID, object)).unwrap();
        let EventPayload::InvoiceSettled { invoice, .. } = paid.payload else {
            panic!("expected invoice payload");
        };
        assert_eq!(invoice.amount_cents, 0);
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        let event =
            WebhookEvent::parse(&body("charge.refunded", json!({ "id": "ch_1" }))).unwrap();
        assert_eq!(event.payload, EventPayload::Unhandled);
        assert!(event.customer_ref().is_none());
    }

    #[test]
    fn test_malformed_bodies_are_rejected() {
        assert!(matches!(
            WebhookEvent::parse(b"not json"),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));

        // known type, wrong object shape
        let err = WebhookEvent::parse(&body(SUBSCRIPTION_CREATED, json!({ "id": "sub_1" })))
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));

        // empty event id
        let err = WebhookEvent::parse(
            &serde_json::to_vec(&json!({
                "id": "",
                "type": SUBSCRIPTION_CREATED,
                "data": { "object": { "id": "sub_1", "customer": "cus_1" } }
            }))
            .unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }
}
