//! Inbound Stripe webhooks
//!
//! Response policy:
//! - signature or payload rejected: 400, the provider must not retry
//! - fault before the event is claimed: 500, the retry is processed fresh
//! - duplicate, or processed with any handler outcome: 200 `{"received": true}`

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use billsync_billing::{HandlerOutcome, WebhookOutcome};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook received without Stripe-Signature header");
            ApiError::BadRequest("Missing Stripe-Signature header".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, body_len = body.len(), "Webhook rejected");
            ApiError::from(e)
        })?;

    let event_id = event.id.clone();
    let event_type = event.event_type.clone();

    match state.billing.webhooks.handle_event(event).await {
        Ok(WebhookOutcome::Duplicate { .. }) => {}
        Ok(WebhookOutcome::Processed {
            outcome: HandlerOutcome::Failed(reason),
            user_id,
            ..
        }) => {
            // Claimed already; the sweep repairs the user's snapshot
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                user_id = ?user_id,
                reason = %reason,
                "Webhook acknowledged despite handler failure"
            );
        }
        Ok(WebhookOutcome::Processed { .. }) => {}
        Err(e) => {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Webhook failed before claim, provider will retry"
            );
            return Err(ApiError::Internal);
        }
    }

    Ok(Json(json!({ "received": true })))
}
