//! Stripe webhook dispatch
//!
//! Lifecycle of a delivery:
//!
//! 1. ledger read check (replays stop here, before any provider call)
//! 2. read-only planning: identity resolution and the audit row
//! 3. claim by inserting the audit row (the unique constraint arbitrates races)
//! 4. side effects: linking, reconciliation
//!
//! Once the row is written the event is never reprocessed, so failures in
//! step 4 are logged and reported as [`HandlerOutcome::Failed`], never as an
//! error. Errors returned from [`WebhookHandler::handle_event`] always mean
//! nothing was claimed and the provider's retry will be processed fresh.

use serde::Serialize;

use crate::error::BillingResult;
use crate::events::{CheckoutMode, EventPayload, InvoiceOutcome, WebhookEvent};
use crate::identity::{IdentityResolver, Resolution};
use crate::ledger::{ClaimOutcome, DedupLedger};
use crate::reconcile::SubscriptionReconciler;
use crate::store::NewProcessedEvent;
use crate::verify::EventVerifier;

/// Result of the side-effect phase for a claimed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum HandlerOutcome {
    Handled,
    /// Nothing to do (unresolved customer, unhandled type, ...)
    Skipped(String),
    /// Claimed but a side effect failed; the sweep repairs state later
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed {
        event_id: String,
        user_id: Option<String>,
        outcome: HandlerOutcome,
    },
    Duplicate {
        event_id: String,
    },
}

/// Side effect decided during planning
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandlerAction {
    /// Associate customer and user, optionally reconciling afterwards
    Link {
        user_id: String,
        customer_ref: String,
        email: Option<String>,
        reconcile: bool,
    },
    /// Re-derive the user's snapshot; `heal_link` writes the local link first
    Reconcile {
        user_id: String,
        customer_ref: String,
        heal_link: bool,
    },
    /// Drop the local link of a deleted customer and reset its user
    Unlink { customer_ref: String },
    LogInvoice {
        outcome: InvoiceOutcome,
        invoice_id: String,
        user_id: String,
    },
    Skip(String),
}

struct Plan {
    audit: NewProcessedEvent,
    action: HandlerAction,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    verifier: EventVerifier,
    ledger: DedupLedger,
    identity: IdentityResolver,
    reconciler: SubscriptionReconciler,
}

impl WebhookHandler {
    pub fn new(
        verifier: EventVerifier,
        ledger: DedupLedger,
        identity: IdentityResolver,
        reconciler: SubscriptionReconciler,
    ) -> Self {
        Self {
            verifier,
            ledger,
            identity,
            reconciler,
        }
    }

    /// Verify and parse a Stripe webhook delivery
    pub fn verify_event(&self, raw: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        self.verifier.verify(raw, signature)
    }

    /// Handle a verified event
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.clone();

        if self.ledger.try_claim(&event_id).await? == ClaimOutcome::AlreadyProcessed {
            tracing::info!(
                event_id = %event_id,
                event_type = %event.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(WebhookOutcome::Duplicate { event_id });
        }

        let Plan { audit, action } = self.plan(&event).await.map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to plan webhook event"
            );
            e
        })?;
        let user_id = audit.user_id.clone();

        if self.ledger.record(audit).await? == ClaimOutcome::AlreadyProcessed {
            return Ok(WebhookOutcome::Duplicate { event_id });
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event.event_type,
            customer_ref = ?event.customer_ref(),
            user_id = ?user_id,
            "Processing Stripe webhook event"
        );

        let outcome = self.execute(&event, action).await;
        match &outcome {
            HandlerOutcome::Handled => {}
            HandlerOutcome::Skipped(reason) => tracing::info!(
                event_id = %event_id,
                event_type = %event.event_type,
                reason = %reason,
                "Webhook event skipped"
            ),
            HandlerOutcome::Failed(reason) => tracing::error!(
                event_id = %event_id,
                event_type = %event.event_type,
                customer_ref = ?event.customer_ref(),
                user_id = ?user_id,
                reason = %reason,
                "Webhook handler failed after claim"
            ),
        }

        Ok(WebhookOutcome::Processed {
            event_id,
            user_id,
            outcome,
        })
    }

    /// Read-only pass: no writes, provider lookups only
    async fn plan(&self, event: &WebhookEvent) -> BillingResult<Plan> {
        let mut audit = NewProcessedEvent {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            user_id: None,
            payment_type: None,
            amount_cents: None,
            currency: None,
            raw_payload: event.raw.clone(),
        };

        let action = match &event.payload {
            EventPayload::CheckoutCompleted(session) => {
                audit.payment_type = Some(session.mode.payment_type().to_string());
                audit.amount_cents = session.amount_total;
                audit.currency = session.currency.clone();

                let user_id = match (&session.user_id, &session.customer_ref) {
                    (Some(user_id), _) => Some(user_id.clone()),
                    (None, Some(customer_ref)) => self
                        .identity
                        .resolve_with_fallback(customer_ref)
                        .await?
                        .user_id()
                        .map(str::to_string),
                    (None, None) => None,
                };
                audit.user_id = user_id.clone();

                match (user_id, &session.customer_ref) {
                    (Some(user_id), Some(customer_ref)) => HandlerAction::Link {
                        user_id,
                        customer_ref: customer_ref.clone(),
                        email: session.customer_email.clone(),
                        reconcile: session.mode == CheckoutMode::Subscription,
                    },
                    (_, None) => HandlerAction::Skip("checkout without customer".to_string()),
                    (None, Some(_)) => {
                        HandlerAction::Skip("checkout customer not resolved".to_string())
                    }
                }
            }

            EventPayload::SubscriptionChanged(subscription) => {
                audit.payment_type = Some("subscription".to_string());

                let resolution = self
                    .identity
                    .resolve_with_fallback(&subscription.customer_ref)
                    .await?;
                audit.user_id = resolution.user_id().map(str::to_string);

                match resolution {
                    Resolution::Linked(user_id) => HandlerAction::Reconcile {
                        user_id,
                        customer_ref: subscription.customer_ref.clone(),
                        heal_link: false,
                    },
                    Resolution::FromProviderMetadata(user_id) => HandlerAction::Reconcile {
                        user_id,
                        customer_ref: subscription.customer_ref.clone(),
                        heal_link: true,
                    },
                    Resolution::Unresolved => {
                        tracing::warn!(
                            event_id = %event.id,
                            customer_ref = %subscription.customer_ref,
                            subscription_ref = %subscription.id,
                            "Subscription event for unknown customer"
                        );
                        HandlerAction::Skip("subscription customer not resolved".to_string())
                    }
                }
            }

            EventPayload::InvoiceSettled { outcome, invoice } => {
                audit.payment_type = Some("invoice".to_string());
                audit.amount_cents = Some(invoice.amount_cents);
                audit.currency = invoice.currency.clone();

                let user_id = match &invoice.customer_ref {
                    Some(customer_ref) => self
                        .identity
                        .resolve_with_fallback(customer_ref)
                        .await?
                        .user_id()
                        .map(str::to_string),
                    None => None,
                };
                audit.user_id = user_id.clone();

                match user_id {
                    Some(user_id) => HandlerAction::LogInvoice {
                        outcome: *outcome,
                        invoice_id: invoice.id.clone(),
                        user_id,
                    },
                    None => HandlerAction::Skip("invoice customer not resolved".to_string()),
                }
            }

            EventPayload::CustomerDeleted { customer_ref } => {
                // The provider no longer knows this customer, so no metadata fallback
                audit.user_id = self.identity.resolve_user_id(customer_ref).await?;
                HandlerAction::Unlink {
                    customer_ref: customer_ref.clone(),
                }
            }

            EventPayload::Unhandled => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Received unhandled Stripe event type - no handler configured"
                );
                HandlerAction::Skip(format!("unhandled event type {}", event.event_type))
            }
        };

        Ok(Plan { audit, action })
    }

    async fn execute(&self, event: &WebhookEvent, action: HandlerAction) -> HandlerOutcome {
        match self.run_action(event, action).await {
            Ok(None) => HandlerOutcome::Handled,
            Ok(Some(reason)) => HandlerOutcome::Skipped(reason),
            Err(e) => HandlerOutcome::Failed(e.to_string()),
        }
    }

    /// `Ok(Some(reason))` when there turned out to be nothing to do
    async fn run_action(
        &self,
        event: &WebhookEvent,
        action: HandlerAction,
    ) -> BillingResult<Option<String>> {
        match action {
            HandlerAction::Link {
                user_id,
                customer_ref,
                email,
                reconcile,
            } => {
                self.identity
                    .link_customer(&user_id, &customer_ref, email.as_deref())
                    .await?;
                if reconcile {
                    self.reconciler
                        .reconcile_customer(&user_id, &customer_ref)
                        .await?;
                }
                Ok(None)
            }

            HandlerAction::Reconcile {
                user_id,
                customer_ref,
                heal_link,
            } => {
                if heal_link {
                    self.identity
                        .link_customer(&user_id, &customer_ref, None)
                        .await?;
                }
                self.reconciler
                    .reconcile_customer(&user_id, &customer_ref)
                    .await?;
                Ok(None)
            }

            HandlerAction::Unlink { customer_ref } => {
                match self.identity.unlink_customer(&customer_ref).await? {
                    Some(user_id) => {
                        self.reconciler.reconcile(&user_id).await?;
                        Ok(None)
                    }
                    None => Ok(Some("deleted customer was not linked".to_string())),
                }
            }

            HandlerAction::LogInvoice {
                outcome,
                invoice_id,
                user_id,
            } => {
                match outcome {
                    InvoiceOutcome::Paid => tracing::info!(
                        event_id = %event.id,
                        invoice_id = %invoice_id,
                        user_id = %user_id,
                        "Invoice paid"
                    ),
                    InvoiceOutcome::PaymentFailed => tracing::warn!(
                        event_id = %event.id,
                        invoice_id = %invoice_id,
                        user_id = %user_id,
                        "Invoice payment failed"
                    ),
                }
                Ok(None)
            }

            HandlerAction::Skip(reason) => Ok(Some(reason)),
        }
    }
}
